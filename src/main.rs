use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use tomato_detector_lib::commands::{self, TRAINED_BUNDLE};
use tomato_detector_lib::logging;
use tomato_detector_lib::model::PipelineConfig;
use tomato_detector_lib::workflow::{run_workflow, WorkflowArgs};

/// トマト葉の病害分類パイプライン
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// 設定ファイル（指定時は読み込みに失敗するとエラー、省略時は pipeline.json かデフォルト設定）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// DEBUG ログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// データセットのフォルダ構成を確認
    Verify {
        #[arg(long)]
        input_dir: Option<PathBuf>,
    },
    /// CLAHE・リサイズ・正規化を適用して保存
    Preprocess {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// 品質フィルタ付きのデータ拡張
    Augment {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// 元画像1枚あたりの生成枚数
        #[arg(long)]
        samples: Option<usize>,
    },
    /// train / validation に分割
    Prepare {
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// 2段階の転移学習を行い、全形式をエクスポート
    Train {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// 学習済みバンドルの保存のみ行う
        #[arg(long)]
        no_export: bool,
        /// ImageNet 重みを指定せず、ランダム初期化のバックボーンから学習する
        #[arg(long)]
        from_scratch: bool,
    },
    /// 保存済みバンドルから全形式を再エクスポート
    Export {
        #[arg(long)]
        bundle: Option<PathBuf>,
        /// キャリブレーション画像を取る分割済みデータ
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// 推論 HTTP サーバーを起動
    Serve {
        #[arg(long)]
        bundle: Option<PathBuf>,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// 複数ステージを順に実行
    Workflow(WorkflowArgs),
    /// 現在の設定を表示
    Config {
        /// デフォルト設定をファイルに書き出す
        #[arg(long)]
        init: bool,
    },
}


fn set_dir(target: &mut PathBuf, value: Option<PathBuf>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // config --init は書き出し先が未作成でもよい
    let mut config = match cli.command {
        Command::Config { init: true } => PipelineConfig::default(),
        _ => PipelineConfig::resolve(cli.config.as_deref())?,
    };

    match cli.command {
        Command::Verify { input_dir } => {
            set_dir(&mut config.paths.raw_dir, input_dir);
            let report = commands::verify(&config)?;
            if !report.ready() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Preprocess { input_dir, output_dir } => {
            set_dir(&mut config.paths.raw_dir, input_dir);
            set_dir(&mut config.paths.processed_dir, output_dir);
            commands::preprocess(&config)?;
        }
        Command::Augment {
            input_dir,
            output_dir,
            samples,
        } => {
            set_dir(&mut config.paths.raw_dir, input_dir);
            set_dir(&mut config.paths.augmented_dir, output_dir);
            if let Some(samples) = samples {
                config.augment.samples_per_image = samples;
            }
            commands::augment(&config)?;
        }
        Command::Prepare { source_dir, data_dir } => {
            set_dir(&mut config.paths.raw_dir, source_dir);
            set_dir(&mut config.paths.data_dir, data_dir);
            commands::prepare(&config)?;
        }
        Command::Train {
            data_dir,
            no_export,
            from_scratch,
        } => {
            set_dir(&mut config.paths.data_dir, data_dir);
            if from_scratch {
                config.model.allow_random_init = true;
            }
            commands::train(&config, !no_export)?;
        }
        Command::Export { bundle, data_dir } => {
            set_dir(&mut config.paths.data_dir, data_dir);
            let bundle = bundle.unwrap_or_else(|| config.paths.artifact_dir.join(TRAINED_BUNDLE));
            commands::export(&config, &bundle)?;
        }
        Command::Serve { bundle, host, port } => {
            let bundle = bundle.unwrap_or_else(|| config.paths.artifact_dir.join(TRAINED_BUNDLE));
            commands::serve(&config, &bundle, &host, port)?;
        }
        Command::Workflow(args) => {
            if !args.any_stage() {
                let mut cmd = Cli::command();
                if let Some(workflow) = cmd.find_subcommand_mut("workflow") {
                    workflow.print_help()?;
                }
                return Ok(ExitCode::FAILURE);
            }
            let code = run_workflow(&args, cli.config.as_deref())?;
            return Ok(ExitCode::from(code.clamp(0, 255) as u8));
        }
        Command::Config { init } => {
            if init {
                match &cli.config {
                    Some(path) => config.save(path)?,
                    None => config.save_default()?,
                }
            }
            config.display();
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{}", e);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
