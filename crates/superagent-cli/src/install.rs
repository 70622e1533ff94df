//! `install`/`uninstall` subcommands: lay down (or remove) a systemd unit
//! and the agent's data directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

const UNIT_PATH_SYSTEM: &str = "/etc/systemd/system/superagentd.service";

fn unit_path(user: bool) -> Result<PathBuf> {
    if user {
        let home = dirs::home_dir().context("could not determine home directory for --user install")?;
        Ok(home.join(".config/systemd/user/superagentd.service"))
    } else {
        Ok(PathBuf::from(UNIT_PATH_SYSTEM))
    }
}

fn unit_contents(data_dir: &str) -> String {
    format!(
        "[Unit]\n\
         Description=superagent deployment daemon\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart=/usr/local/bin/superagentd\n\
         Environment=SUPERAGENT_AGENT_DATA_DIR={data_dir}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n"
    )
}

pub fn install(systemd: bool, user: bool, data_dir: Option<String>) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| "/var/lib/superagent".to_string());
    fs::create_dir_all(&data_dir).with_context(|| format!("failed to create data dir {data_dir}"))?;

    if systemd {
        let path = unit_path(user)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, unit_contents(&data_dir)).with_context(|| format!("failed to write unit file to {}", path.display()))?;
        println!("installed unit: {}", path.display());
        println!("enable it with: systemctl{} enable --now superagentd", if user { " --user" } else { "" });
    } else {
        println!("data directory ready at {data_dir}; run `superagentd` directly or pass --systemd to install a unit");
    }

    Ok(())
}

pub fn uninstall(force: bool) -> Result<()> {
    for user in [false, true] {
        let Ok(path) = unit_path(user) else { continue };
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
            println!("removed unit: {}", path.display());
        }
    }

    if !force {
        println!("data directory left in place; pass --force to also remove persisted state");
        return Ok(());
    }

    if let Ok(config) = superagent_config::load() {
        let data_dir = &config.agent.data_dir;
        if data_dir.exists() {
            fs::remove_dir_all(data_dir).with_context(|| format!("failed to remove data dir {}", data_dir.display()))?;
            println!("removed data directory: {}", data_dir.display());
        }
    }

    Ok(())
}
