//! Host identity: hostname, platform and primary address

use serde::Serialize;
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    pub system: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub platform: PlatformInfo,
    pub ip_address: String,
}

impl HostInfo {
    pub async fn collect() -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                debug!("gethostname failed: {e}");
                "localhost".to_string()
            });
        let ip_address = resolve_address(&hostname).await;

        Self {
            hostname,
            platform: platform_info(),
            ip_address,
        }
    }
}

fn platform_info() -> PlatformInfo {
    match nix::sys::utsname::uname() {
        Ok(uts) => PlatformInfo {
            system: uts.sysname().to_string_lossy().into_owned(),
            release: uts.release().to_string_lossy().into_owned(),
            version: uts.version().to_string_lossy().into_owned(),
            machine: uts.machine().to_string_lossy().into_owned(),
        },
        Err(e) => {
            debug!("uname failed: {e}");
            PlatformInfo {
                system: std::env::consts::OS.to_string(),
                release: String::new(),
                version: String::new(),
                machine: std::env::consts::ARCH.to_string(),
            }
        }
    }
}

/// First address the hostname resolves to, IPv4 preferred
async fn resolve_address(hostname: &str) -> String {
    let addrs: Vec<IpAddr> = match tokio::net::lookup_host((hostname, 0)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            debug!("Cannot resolve {hostname}: {e}");
            Vec::new()
        }
    };

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
