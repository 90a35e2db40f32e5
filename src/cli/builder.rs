use super::boot_engine;
use anyhow::{Context, Result, bail};
use clap::Args;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct BuilderCommand {
    /// Directory holding the Containerfile
    pub context: PathBuf,
    /// Build argument as KEY=VALUE, repeatable
    #[arg(long = "build-arg", value_name = "KEY=VALUE")]
    pub build_args: Vec<String>,
}

pub async fn run(cmd: BuilderCommand, config_dir: &Path) -> Result<()> {
    let build_args = parse_build_args(&cmd.build_args)?;
    let context = std::fs::canonicalize(&cmd.context)
        .with_context(|| format!("build context {:?} not found", cmd.context))?;

    let engine = boot_engine(config_dir).await?;
    println!("🏗️  Building image from {:?}...", context);
    let image = engine.system().build_image(&context, &build_args).await?;
    println!("✅ Built {}", image.reference);

    Ok(())
}

fn parse_build_args(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut args = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("build argument '{item}' must be KEY=VALUE");
        };
        if key.trim().is_empty() {
            bail!("build argument '{item}' has an empty key");
        }
        args.insert(key.trim().to_string(), value.to_string());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_args() {
        let args = parse_build_args(&["RUST=1.85".into(), "EMPTY=".into()]).unwrap();
        assert_eq!(args["RUST"], "1.85");
        assert_eq!(args["EMPTY"], "");

        assert!(parse_build_args(&["NOVALUE".into()]).is_err());
        assert!(parse_build_args(&["=x".into()]).is_err());
    }
}
