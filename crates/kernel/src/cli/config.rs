//! `config` subcommand — configuration utilities.

use tenex_domain::config::{Config, ConfigSeverity};

/// Parse the config file and report any validation issues. Exits the
/// process with code 1 if any issue is `Error` severity.
pub fn validate(config: &Config, config_path: &str) -> anyhow::Result<()> {
    let issues = config.validate();
    for issue in &issues {
        println!("{issue}");
    }
    let errors = issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count();
    if errors > 0 {
        println!("{config_path}: {errors} error(s)");
        std::process::exit(1);
    }
    println!("{config_path}: OK");
    Ok(())
}

/// Dump the resolved configuration (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
