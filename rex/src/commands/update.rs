//! `rex update` handler.

use rex_common::selfupdate::Updater;
use serde_json::json;

use crate::commands::{print_json, EXIT_OK, EXIT_RUNTIME, EXIT_USAGE};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn update(check_only: bool, yes: bool) -> i32 {
    let updater = Updater::new("rex", VERSION);
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    let check = match updater.check(os, arch).await {
        Ok(check) => check,
        Err(err) => {
            eprintln!("update check failed: {err}");
            return EXIT_RUNTIME;
        }
    };
    if check_only {
        print_json(&json!({
            "binary": "rex",
            "current_version": check.current_version,
            "latest_version": check.latest_version,
            "comparable": check.comparable,
            "update_available": check.update_available,
            "asset": check.asset_name,
        }));
        return EXIT_OK;
    }
    if check.comparable && !check.update_available {
        println!("rex is up to date ({})", check.current_version);
        return EXIT_OK;
    }
    if !yes {
        eprintln!(
            "update rex from {} to {}? use --yes to confirm",
            check.current_version, check.latest_version
        );
        return EXIT_USAGE;
    }
    match updater.update(os, arch).await {
        Ok(latest) => {
            println!("updated rex to {latest}");
            EXIT_OK
        }
        Err(err) => {
            eprintln!("update failed: {err}");
            EXIT_RUNTIME
        }
    }
}
