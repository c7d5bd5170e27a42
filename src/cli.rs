//! CLI argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cordatus_flash::compat::DeviceSelector;

#[derive(Parser)]
#[command(name = "cordatus-flash")]
#[command(author, version, about = "Flash Jetson-class boards from a device/release/storage selection", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file (defaults to <config dir>/cordatus-flash/settings.json)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Compatibility table (JSON), overrides the settings file
    ///
    /// Without it the table at the configured path is used, or the bundled
    /// Jetson table if that file does not exist.
    #[arg(long, global = true)]
    pub table: Option<PathBuf>,

    /// Family rules file (JSON) replacing the built-in rules
    #[arg(long, global = true)]
    pub rules: Option<PathBuf>,

    /// Archive cache root, overrides the settings file
    #[arg(long, global = true)]
    pub cache_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Device/release/storage selection shared by `plan` and `flash`
#[derive(clap::Args, Debug, Clone)]
pub struct SelectorArgs {
    #[arg(long)]
    pub vendor: String,

    #[arg(long)]
    pub product: String,

    #[arg(long)]
    pub module: String,

    /// Release (JetPack) version, e.g. 6.2
    #[arg(long)]
    pub release: String,

    /// Target storage, e.g. emmc, sd, nvme
    #[arg(long)]
    pub storage: String,
}

impl SelectorArgs {
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            vendor: self.vendor.clone(),
            product: self.product.clone(),
            module: self.module.clone(),
            release_version: self.release.clone(),
            storage: self.storage.clone(),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct OptionArgs {
    /// Keep downloads and extracted trees after a successful flash
    #[arg(long)]
    pub keep_files: bool,

    /// Default user created on the device and owner of kept files
    /// (defaults to $SUDO_USER or $USER)
    #[arg(long)]
    pub username: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the choices at the next level of the selection
    ///
    /// Without arguments lists vendors; each given level narrows the list.
    Options {
        #[arg(long)]
        vendor: Option<String>,

        #[arg(long, requires = "vendor")]
        product: Option<String>,

        #[arg(long, requires = "product")]
        module: Option<String>,

        #[arg(long, requires = "module")]
        release: Option<String>,
    },

    /// Print the resolved flash plan as JSON
    Plan {
        #[command(flatten)]
        selector: SelectorArgs,

        #[command(flatten)]
        options: OptionArgs,
    },

    /// Download, prepare and flash a board in forced recovery mode
    Flash {
        #[command(flatten)]
        selector: SelectorArgs,

        #[command(flatten)]
        options: OptionArgs,

        /// Identifier of the board; one session per identifier at a time
        #[arg(long, default_value = "default")]
        device: String,
    },

    /// Remove a cached release
    Evict {
        #[arg(long)]
        family: String,

        #[arg(long)]
        version: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flash() {
        let cli = Cli::try_parse_from([
            "cordatus-flash",
            "flash",
            "--vendor",
            "Acme",
            "--product",
            "P1",
            "--module",
            "M2",
            "--release",
            "6.2",
            "--storage",
            "external-ssd",
            "--keep-files",
            "--device",
            "bench-3",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                selector,
                options,
                device,
            } => {
                assert_eq!(selector.selector().release_version, "6.2");
                assert!(options.keep_files);
                assert_eq!(options.username, None);
                assert_eq!(device, "bench-3");
            }
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_options_levels_require_parents() {
        assert!(Cli::try_parse_from(["cordatus-flash", "options", "--product", "P1"]).is_err());
        assert!(Cli::try_parse_from(["cordatus-flash", "options", "--vendor", "Acme"]).is_ok());
    }
}
