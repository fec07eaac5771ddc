/*!
 * rfkill Recovery
 * Best-effort unblock of an OS-level soft block on the bluetooth radio.
 * Safe to call when rfkill is missing or nothing is blocked.
 */

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::info;

/// Unblock the bluetooth radio if (and only if) rfkill reports it as
/// soft-blocked. A hard block (physical switch) cannot be cleared from
/// software and is left alone.
pub async fn try_unblock() -> Result<()> {
    let output = Command::new("rfkill")
        .args(["list", "bluetooth"])
        .output()
        .await
        .context("rfkill not found")?;

    if !output.status.success() {
        return Err(anyhow!(
            "rfkill list bluetooth failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    if !is_soft_blocked(&String::from_utf8_lossy(&output.stdout)) {
        return Ok(());
    }

    info!("bluetooth is soft-blocked via rfkill, unblocking");
    let status = Command::new("rfkill")
        .args(["unblock", "bluetooth"])
        .status()
        .await
        .context("rfkill not found")?;

    if !status.success() {
        return Err(anyhow!("rfkill unblock bluetooth failed: {status}"));
    }

    Ok(())
}

fn is_soft_blocked(listing: &str) -> bool {
    listing.to_lowercase().contains("soft blocked: yes")
}
