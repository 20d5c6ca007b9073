use anyhow::Result;

/// Installs a global logger. `RUST_LOG` overrides `default_level`.
pub fn set_up_logging(default_level: log::LevelFilter) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_env("RUST_LOG")
        .format_timestamp_millis()
        .try_init()?;

    Ok(())
}
