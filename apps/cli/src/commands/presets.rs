//! 预设命令：列出预设帧与分组

use anyhow::{Context, Result};
use busview_driver::Preset;
use clap::Args;

use crate::modes::oneshot::OneShotMode;

/// 预设命令参数
#[derive(Args, Debug)]
pub struct PresetsCommand {
    /// 列出分组而不是预设
    #[arg(short, long)]
    pub groups: bool,

    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

impl PresetsCommand {
    pub async fn execute(self, mode: &OneShotMode) -> Result<()> {
        let store = mode.preset_store();

        if self.groups {
            let groups = store.groups().with_context(|| {
                format!("读取分组失败: {}", store.groups_path().display())
            })?;
            if self.json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
                return Ok(());
            }
            if groups.is_empty() {
                println!("(没有分组: {})", store.groups_path().display());
            }
            for group in &groups {
                println!("{} ({} 帧)", group.name, group.frames.len());
                for preset in &group.frames {
                    println!("  {}", format_preset(preset));
                }
            }
            return Ok(());
        }

        let presets = store
            .list()
            .with_context(|| format!("读取预设失败: {}", store.presets_path().display()))?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&presets)?);
            return Ok(());
        }
        if presets.is_empty() {
            println!("(没有预设: {})", store.presets_path().display());
        }
        for preset in &presets {
            println!("{}", format_preset(preset));
        }
        Ok(())
    }
}

fn format_preset(preset: &Preset) -> String {
    format!("{:<24} {:>8}  {}", preset.name, preset.id_hex, preset.data_hex)
}
