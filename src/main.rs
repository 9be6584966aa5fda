use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use plugman::{PluginManager, PluginManagerOptions, SatisfyMode};

/// plugman - dynamic plugin manager
///
/// Install npm-style packages into a local plugin store and run them in
/// sandboxed CommonJS contexts.
///
/// Examples:
///   plugman install cookie --selector 0.3.1
///   plugman run "module.exports = require('cookie').parse('a=1')"
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Plugin store directory (defaults to ./plugin_packages; also via PLUGMAN_ROOT)
    #[arg(
        long = "root",
        short = 'r',
        env = "PLUGMAN_ROOT",
        value_name = "PATH",
        global = true
    )]
    root: Option<PathBuf>,

    /// npm registry URL (defaults to the public registry)
    #[arg(long = "registry", value_name = "URL", global = true)]
    registry: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install a package: a registry name, an owner/repo#ref, or a path
    Install(InstallArgs),

    /// Remove an installed plugin
    Uninstall(UninstallArgs),

    /// List installed plugins
    List,

    /// Show metadata of an installed plugin
    Info(InfoArgs),

    /// Run a script with require() resolving against the plugin store
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Package name, owner/repo#ref, or filesystem path
    #[arg(value_name = "SPEC")]
    spec: String,

    /// Version range, tag, or git ref
    #[arg(long, short = 's', value_name = "SELECTOR")]
    selector: Option<String>,
}

#[derive(clap::Args, Debug)]
struct UninstallArgs {
    #[arg(value_name = "NAME")]
    name: String,
}

#[derive(clap::Args, Debug)]
struct InfoArgs {
    #[arg(value_name = "NAME")]
    name: String,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// CommonJS source; its module.exports is printed as JSON
    #[arg(value_name = "CODE")]
    code: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let mut options = PluginManagerOptions::default();
    if let Some(root) = cli.root {
        options.plugins_path = Some(root);
    }
    if let Some(registry) = cli.registry {
        options.npm_registry_url = registry;
    }
    let manager = PluginManager::with_options(options)?;

    match cli.command {
        Commands::Install(args) => {
            let plugin = manager.install(&args.spec, args.selector.as_deref()).await?;
            println!("installed {}@{}", plugin.name, plugin.version);
        }
        Commands::Uninstall(args) => {
            if manager.uninstall(&args.name).await? {
                println!("uninstalled {}", args.name);
            } else {
                println!("{} is not installed", args.name);
            }
        }
        Commands::List => {
            for plugin in manager.list() {
                println!("{}@{}", plugin.name, plugin.version);
            }
        }
        Commands::Info(args) => {
            match manager.already_installed(&args.name, None, SatisfyMode::Satisfies) {
                Some(plugin) => println!("{}", serde_json::to_string_pretty(&plugin)?),
                None => anyhow::bail!("{} is not installed", args.name),
            }
        }
        Commands::Run(args) => {
            let result = manager.run_script(&args.code)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
