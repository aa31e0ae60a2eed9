//! ワークフロー実行
//!
//! 指定されたステージを同じ実行ファイルのサブプロセスとして順に起動します。
//! 終了コードが 0 以外のステージがあればそこで停止し、そのコードを返します。

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::process::Command;

/// `workflow` サブコマンドの引数
#[derive(Args, Debug, Clone, Default)]
pub struct WorkflowArgs {
    /// 前処理ステージを実行
    #[arg(long)]
    pub preprocess: bool,
    /// データ拡張ステージを実行
    #[arg(long)]
    pub augment: bool,
    /// train / validation 分割ステージを実行
    #[arg(long)]
    pub prepare: bool,
    /// 学習（+エクスポート）ステージを実行
    #[arg(long)]
    pub train: bool,
    /// 全ステージを順に実行
    #[arg(long)]
    pub all: bool,
    /// 元画像1枚あたりの拡張枚数
    #[arg(long, default_value_t = 3)]
    pub samples: usize,
    #[arg(long)]
    pub raw_dir: Option<PathBuf>,
    #[arg(long)]
    pub processed_dir: Option<PathBuf>,
    #[arg(long)]
    pub augmented_dir: Option<PathBuf>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// 学習ステージをランダム初期化のバックボーンから始める
    #[arg(long)]
    pub from_scratch: bool,
}

/// 1つのステージ（サブコマンド名と引数）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    pub args: Vec<String>,
}

fn push_dir(args: &mut Vec<String>, flag: &str, dir: &Option<PathBuf>) {
    if let Some(dir) = dir {
        args.push(flag.to_string());
        args.push(dir.display().to_string());
    }
}

impl WorkflowArgs {
    pub fn any_stage(&self) -> bool {
        self.preprocess || self.augment || self.prepare || self.train || self.all
    }

    /// 実行するステージを順に並べる
    ///
    /// `config` が指定されていれば全ステージに `--config` を渡します。
    pub fn build_stages(&self, config: Option<&Path>) -> Vec<Stage> {
        let mut stages = Vec::new();

        if self.preprocess || self.all {
            let mut args = vec!["preprocess".to_string()];
            push_dir(&mut args, "--input-dir", &self.raw_dir);
            push_dir(&mut args, "--output-dir", &self.processed_dir);
            stages.push(Stage { name: "preprocess", args });
        }
        if self.augment || self.all {
            let mut args = vec!["augment".to_string(), "--samples".to_string(), self.samples.to_string()];
            push_dir(&mut args, "--input-dir", &self.raw_dir);
            push_dir(&mut args, "--output-dir", &self.augmented_dir);
            stages.push(Stage { name: "augment", args });
        }
        if self.prepare || self.all {
            let mut args = vec!["prepare".to_string()];
            push_dir(&mut args, "--source-dir", &self.raw_dir);
            push_dir(&mut args, "--data-dir", &self.data_dir);
            stages.push(Stage { name: "prepare", args });
        }
        if self.train || self.all {
            let mut args = vec!["train".to_string()];
            push_dir(&mut args, "--data-dir", &self.data_dir);
            if self.from_scratch {
                args.push("--from-scratch".to_string());
            }
            stages.push(Stage { name: "train", args });
        }

        if let Some(config) = config {
            for stage in &mut stages {
                stage.args.push("--config".to_string());
                stage.args.push(config.display().to_string());
            }
        }
        stages
    }
}

/// ステージを順に実行し、最初に失敗したステージの終了コード（全成功なら 0）を返す
pub fn run_stages(program: &Path, stages: &[Stage]) -> Result<i32> {
    for (i, stage) in stages.iter().enumerate() {
        tracing::info!("[{}/{}] {} を実行: {}", i + 1, stages.len(), stage.name, stage.args.join(" "));
        let status = Command::new(program)
            .args(&stage.args)
            .status()
            .context(format!("Failed to launch stage '{}'", stage.name))?;

        // シグナル終了などでコードが無い場合は 1 とみなす
        let code = status.code().unwrap_or(1);
        if code != 0 {
            tracing::error!("{} が終了コード {} で失敗しました", stage.name, code);
            return Ok(code);
        }
    }
    tracing::info!("ワークフローが完了しました");
    Ok(0)
}

/// 現在の実行ファイルで全ステージを実行する
pub fn run_workflow(args: &WorkflowArgs, config: Option<&Path>) -> Result<i32> {
    let stages = args.build_stages(config);
    let program = std::env::current_exe().context("Failed to locate current executable")?;
    run_stages(&program, &stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> WorkflowArgs {
        WorkflowArgs {
            samples: 3,
            ..WorkflowArgs::default()
        }
    }

    #[test]
    fn test_no_flags_means_no_stages() {
        assert!(!args().any_stage());
        assert!(args().build_stages(None).is_empty());
    }

    #[test]
    fn test_all_runs_stages_in_order() {
        let stages = WorkflowArgs { all: true, ..args() }.build_stages(None);
        let names: Vec<_> = stages.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["preprocess", "augment", "prepare", "train"]);
        assert_eq!(stages[1].args, vec!["augment", "--samples", "3"]);
    }

    #[test]
    fn test_custom_dirs_and_config_are_forwarded() {
        let workflow = WorkflowArgs {
            augment: true,
            train: true,
            samples: 5,
            raw_dir: Some(PathBuf::from("raw")),
            augmented_dir: Some(PathBuf::from("aug")),
            data_dir: Some(PathBuf::from("d")),
            from_scratch: true,
            ..args()
        };
        let stages = workflow.build_stages(Some(Path::new("p.json")));
        assert_eq!(
            stages[0].args,
            vec!["augment", "--samples", "5", "--input-dir", "raw", "--output-dir", "aug", "--config", "p.json"]
        );
        assert_eq!(
            stages[1].args,
            vec!["train", "--data-dir", "d", "--from-scratch", "--config", "p.json"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_stops_at_first_failure() {
        let stage = |script: &str| Stage {
            name: "sh",
            args: vec!["-c".to_string(), script.to_string()],
        };
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let stages = vec![
            stage("exit 0"),
            stage("exit 3"),
            stage(&format!("touch {}", marker.display())),
        ];
        assert_eq!(run_stages(Path::new("sh"), &stages).unwrap(), 3);
        assert!(!marker.exists());
        assert_eq!(run_stages(Path::new("sh"), &stages[..1]).unwrap(), 0);
    }
}
