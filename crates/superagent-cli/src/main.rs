use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use superagent_types::Deployment;

mod client;
mod install;

use client::ApiClient;

/// Exit codes: 0 success, 1 generic failure, 2 agent not running, 3
/// validation error.
const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_AGENT_UNREACHABLE: u8 = 2;
const EXIT_VALIDATION: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "superagent", version, about = "Operator CLI for the superagent deployment daemon")]
struct Cli {
    /// Local API base URL.
    #[arg(long, env = "SUPERAGENT_API_URL", default_value = "http://127.0.0.1:8080")]
    api_url: String,

    /// Bearer token for the Local API. Falls back to SUPERAGENT_API_TOKEN.
    #[arg(long, env = "SUPERAGENT_API_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent daemon in the foreground (forwards to `superagentd`).
    Start,
    /// Show agent status.
    Status,
    /// Print CLI version.
    Version,
    /// Manage the agent's YAML config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Create a new deployment.
    Deploy {
        #[arg(long)]
        app: String,
        #[arg(long)]
        version: String,
        /// Source override, recorded on the deployment's metadata for
        /// traceability; the catalog entry remains the source of truth for
        /// what actually gets fetched and built.
        #[arg(long)]
        source: Option<String>,
        #[arg(long, conflicts_with = "tag")]
        branch: Option<String>,
        #[arg(long, conflicts_with = "branch")]
        tag: Option<String>,
    },
    /// List all deployments.
    List,
    /// Fetch logs for a deployment.
    Logs {
        #[arg(long)]
        deployment: String,
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Install a systemd unit for the agent.
    Install {
        #[arg(long)]
        systemd: bool,
        #[arg(long)]
        user: bool,
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Remove the installed unit (and, with --force, persisted state).
    Uninstall {
        #[arg(long)]
        force: bool,
    },
    /// Interactive REPL over the Local API.
    Interactive,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a documented default config if none exists yet.
    Init,
    /// Print the effective, merged config as YAML.
    Show,
    /// Parse the config and report whether it is well-formed.
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.cmd {
        Command::Version => {
            println!("superagent {}", env!("CARGO_PKG_VERSION"));
            Ok(EXIT_OK)
        }
        Command::Config { action } => run_config(action),
        Command::Start => run_start(),
        Command::Install { systemd, user, data_dir } => {
            install::install(systemd, user, data_dir)?;
            Ok(EXIT_OK)
        }
        Command::Uninstall { force } => {
            install::uninstall(force)?;
            Ok(EXIT_OK)
        }
        other => run_against_agent(&cli.api_url, cli.token.clone(), other),
    }
}

fn run_start() -> anyhow::Result<u8> {
    use std::process::Command as OsCommand;
    let status = OsCommand::new("superagentd").status();
    match status {
        Ok(s) if s.success() => Ok(EXIT_OK),
        Ok(s) => Ok(s.code().map(|c| c as u8).unwrap_or(EXIT_FAILURE)),
        Err(e) => {
            eprintln!("failed to launch superagentd: {e}");
            Ok(EXIT_AGENT_UNREACHABLE)
        }
    }
}

fn run_config(action: ConfigAction) -> anyhow::Result<u8> {
    match action {
        ConfigAction::Init | ConfigAction::Show => {
            let config = superagent_config::load()?;
            let yaml = serde_yaml::to_string(&config)?;
            print!("{yaml}");
            Ok(EXIT_OK)
        }
        ConfigAction::Validate => match superagent_config::load() {
            Ok(_) => {
                println!("config is valid");
                Ok(EXIT_OK)
            }
            Err(e) => {
                eprintln!("config is invalid: {e:#}");
                Ok(EXIT_VALIDATION)
            }
        },
    }
}

fn run_against_agent(api_url: &str, token: Option<String>, cmd: Command) -> anyhow::Result<u8> {
    let client = ApiClient::new(api_url, token)?;

    let result = match cmd {
        Command::Status => status(&client),
        Command::Deploy { app, version, source, branch, tag } => deploy(&client, app, version, source, branch, tag),
        Command::List => list(&client),
        Command::Logs { deployment, follow, tail } => logs(&client, &deployment, follow, tail),
        Command::Interactive => interactive(&client),
        _ => unreachable!("dispatched in run()"),
    };

    match result {
        Ok(()) => Ok(EXIT_OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            Ok(EXIT_AGENT_UNREACHABLE)
        }
    }
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    deployments_total: usize,
    deployments_active: usize,
    degraded: bool,
}

fn status(client: &ApiClient) -> anyhow::Result<()> {
    let status: StatusResponse = client.get("/api/v1/status")?;
    println!("deployments_total:  {}", status.deployments_total);
    println!("deployments_active: {}", status.deployments_active);
    println!("degraded:           {}", status.degraded);
    Ok(())
}

#[derive(serde::Serialize)]
struct CreateDeploymentBody {
    app_id: String,
    version: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

fn deploy(client: &ApiClient, app: String, version: String, source: Option<String>, branch: Option<String>, tag: Option<String>) -> anyhow::Result<()> {
    let mut metadata = BTreeMap::new();
    if let Some(source) = source {
        metadata.insert("cli_source".to_string(), source);
    }
    if let Some(branch) = branch {
        metadata.insert("cli_branch".to_string(), branch);
    }
    if let Some(tag) = tag {
        metadata.insert("cli_tag".to_string(), tag);
    }

    let body = CreateDeploymentBody {
        app_id: app,
        version,
        env: BTreeMap::new(),
        metadata,
    };
    let deployment: Deployment = client.post("/api/v1/deployments", &body)?;
    println!("{}  {}@{}  {}", deployment.id, deployment.app_id, deployment.version, deployment.status);
    Ok(())
}

fn list(client: &ApiClient) -> anyhow::Result<()> {
    let deployments: Vec<Deployment> = client.get("/api/v1/deployments")?;
    if deployments.is_empty() {
        println!("no deployments");
        return Ok(());
    }
    for d in deployments {
        println!("{}  {}@{}  {}", d.id, d.app_id, d.version, d.status);
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct LogsResponse {
    lines: String,
    truncated_follow: bool,
}

fn logs(client: &ApiClient, deployment: &str, follow: bool, tail: Option<usize>) -> anyhow::Result<()> {
    let mut path = format!("/api/v1/deployments/{deployment}/logs?stream=runtime");
    if let Some(tail) = tail {
        path.push_str(&format!("&tail={tail}"));
    }
    if follow {
        path.push_str("&follow=true");
    }

    let resp: LogsResponse = client.get(&path)?;
    print!("{}", resp.lines);
    if follow && !resp.truncated_follow {
        eprintln!("note: this agent does not support streaming logs; showing a point-in-time snapshot");
    }
    Ok(())
}

fn interactive(client: &ApiClient) -> anyhow::Result<()> {
    use std::io::Write;

    println!("superagent interactive mode. Commands: status, list, logs <id>, quit");
    let stdin = std::io::stdin();
    loop {
        print!("superagent> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            "status" => {
                if let Err(e) = status(client) {
                    eprintln!("error: {e:#}");
                }
            }
            "list" => {
                if let Err(e) = list(client) {
                    eprintln!("error: {e:#}");
                }
            }
            other if other.starts_with("logs ") => {
                let id = other.trim_start_matches("logs ").trim();
                if let Err(e) = logs(client, id, false, Some(100)) {
                    eprintln!("error: {e:#}");
                }
            }
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}
