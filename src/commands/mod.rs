//! CLI command handlers
//!
//! Builds the application context from settings and flags, then hands off
//! to the query or operation handlers.

mod operations;
mod query;

use std::path::Path;
use std::sync::Arc;

use cordatus_flash::compat::{CompatibilityTable, JsonTable};
use cordatus_flash::config::Settings;
use cordatus_flash::plan::{ConfigResolver, FlashOptions, RuleSet};
use cordatus_flash::{log_debug, log_info};

use crate::cli::{Cli, Commands, OptionArgs};

const MODULE: &str = "commands";

/// Settings plus the loaded table and rules
pub struct AppContext {
    pub settings: Settings,
    pub table: Arc<JsonTable>,
    pub rules: RuleSet,
}

impl AppContext {
    pub fn load(cli: &Cli) -> Result<Self, String> {
        let mut settings = match &cli.settings {
            Some(path) => Settings::load_from(path)?
                .ok_or_else(|| format!("Settings file {} does not exist", path.display()))?,
            None => Settings::load(),
        };
        if let Some(table) = &cli.table {
            settings.table_path = table.clone();
        }
        if let Some(rules) = &cli.rules {
            settings.rules_path = Some(rules.clone());
        }
        if let Some(root) = &cli.cache_root {
            settings.cache_root = root.clone();
        }
        log_debug!(MODULE, "Effective settings: {:?}", settings);

        // An explicit --table must exist; the default location may be empty
        let table = match &cli.table {
            Some(_) => JsonTable::load(&settings.table_path)?,
            None => JsonTable::load_or_bundled(&settings.table_path)?,
        };
        let table = Arc::new(table);
        let rules = match &settings.rules_path {
            Some(path) => RuleSet::load(path)?,
            None => RuleSet::builtin(),
        };

        Ok(Self {
            settings,
            table,
            rules,
        })
    }

    pub fn resolver(&self) -> ConfigResolver {
        ConfigResolver::new(self.table.clone(), self.rules.clone())
    }

    pub fn cache_root(&self) -> &Path {
        &self.settings.cache_root
    }
}

/// Operator options, filling in the invoking user when none is given
pub fn flash_options(args: &OptionArgs) -> Result<FlashOptions, String> {
    let username = match &args.username {
        Some(name) => name.clone(),
        // Under sudo the invoking account is in SUDO_USER
        None => std::env::var("SUDO_USER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| "Cannot determine the user name, pass --username".to_string())?,
    };
    Ok(FlashOptions {
        keep_files: args.keep_files,
        username,
    })
}

/// Run a command; `Ok(false)` means it ran but did not succeed
pub async fn dispatch(cli: Cli) -> Result<bool, String> {
    let ctx = AppContext::load(&cli)?;
    log_info!(
        MODULE,
        "Loaded {} compatibility entries and {} family rules",
        ctx.table.rows().len(),
        ctx.rules.rules.len()
    );

    match cli.command {
        Commands::Options {
            vendor,
            product,
            module,
            release,
        } => {
            query::options(
                &ctx,
                vendor.as_deref(),
                product.as_deref(),
                module.as_deref(),
                release.as_deref(),
            );
            Ok(true)
        }
        Commands::Plan { selector, options } => {
            query::plan(&ctx, &selector.selector(), &flash_options(&options)?)?;
            Ok(true)
        }
        Commands::Flash {
            selector,
            options,
            device,
        } => operations::flash(&ctx, selector.selector(), flash_options(&options)?, device).await,
        Commands::Evict { family, version } => {
            operations::evict(&ctx, &family, &version).await?;
            Ok(true)
        }
    }
}
