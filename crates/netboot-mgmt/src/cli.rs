use anyhow::Result;
use clap::{Parser, Subcommand};
use netboot_iscsi::{BootLogEntry, Device, Image, ImageMetrics, OperationResult};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::path::PathBuf;

/// Command line for the netboot management server and its client commands.
#[derive(Parser)]
#[command(name = "netboot-mgmt")]
#[command(about = "Netboot iSCSI image and device management", long_about = None)]
pub struct Cli {
    /// Admin API base URL.
    #[arg(short, long, default_value = "http://localhost:8000")]
    pub server: String,

    /// Bearer token for the admin API.
    #[arg(short, long, env = "NETBOOT_ADMIN_TOKEN")]
    pub token: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// iSCSI image operations.
    Image {
        /// Image subcommand.
        #[command(subcommand)]
        cmd: ImageCmd,
    },
    /// Device registry operations.
    Device {
        /// Device subcommand.
        #[command(subcommand)]
        cmd: DeviceCmd,
    },
    /// Shows recent boot log entries.
    Logs {
        /// Only entries for this MAC.
        #[arg(short, long)]
        mac: Option<String>,
        /// Maximum number of entries.
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Runs the admin API server.
    Serve {
        /// Config file (`.toml` or `.json`).
        #[arg(short, long, default_value = "/etc/netboot/mgmt.toml")]
        config: PathBuf,
    },
}

/// Image subcommands.
#[derive(Subcommand, Clone)]
pub enum ImageCmd {
    /// Lists images.
    List,
    /// Creates a sparse image.
    Create {
        /// Image name.
        name: String,
        /// Size in GiB.
        size_gb: u64,
    },
    /// Deletes an image and its target.
    Delete {
        /// Image name.
        name: String,
    },
    /// Copies an image under a new name.
    Copy {
        /// Source image.
        source: String,
        /// Destination image.
        dest: String,
    },
    /// Renames an image, keeping its link.
    Rename {
        /// Source image.
        source: String,
        /// New name.
        dest: String,
    },
    /// Links an image to a device MAC.
    Link {
        /// Image name.
        name: String,
        /// Device MAC.
        mac: String,
    },
    /// Releases an image's device link.
    Unlink {
        /// Image name.
        name: String,
    },
    /// Shows session telemetry and stall state.
    Metrics {
        /// Image name.
        name: String,
    },
}

/// Device subcommands.
#[derive(Subcommand, Clone)]
pub enum DeviceCmd {
    /// Lists devices.
    List,
    /// Registers a device.
    Register {
        /// Device MAC.
        mac: String,
        /// `raspi`, `x86` or `x64`.
        device_type: String,
        /// Display name.
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// Changes a device's profile; omitted fields stay as they are.
    Update {
        /// Device MAC.
        mac: String,
        /// New display name.
        #[arg(short, long)]
        name: Option<String>,
        /// New type: `raspi`, `x86` or `x64`.
        #[arg(long)]
        device_type: Option<String>,
        /// Allow (`true`) or block (`false`) booting.
        #[arg(short, long)]
        enabled: Option<bool>,
        /// Kernel set used when booting without an image.
        #[arg(short, long)]
        kernel_set: Option<String>,
    },
    /// Unlinks and removes a device.
    Delete {
        /// Device MAC.
        mac: String,
    },
    /// Resets a device's transfer counters.
    ResetTransfer {
        /// Device MAC.
        mac: String,
    },
}

impl Cli {
    /// Runs a client subcommand against the admin API.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Image { ref cmd } => self.image(cmd).await,
            Command::Device { ref cmd } => self.device(cmd).await,
            Command::Logs { ref mac, limit } => self.logs(mac.as_deref(), limit).await,
            Command::Serve { .. } => anyhow::bail!("serve is handled by the binary entry point"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.trim_end_matches('/'), path)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let mut request = request;
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!("Request failed: {}", status);
        }

        let result: OperationResult<T> = response.json().await?;
        if !result.success {
            anyhow::bail!(
                "Request failed ({}): {}",
                status,
                result.error.unwrap_or_default()
            );
        }
        Ok(result.data)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.call(request)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Response carried no data"))
    }

    async fn image(&self, cmd: &ImageCmd) -> Result<()> {
        let client = Client::new();
        match cmd {
            ImageCmd::List => {
                let images: Vec<Image> = self
                    .send(client.get(self.url("/api/v1/iscsi/images")))
                    .await?;
                println!(
                    "{:<24} {:>8} {:<13} {:<18} TARGET",
                    "NAME", "SIZE", "STATUS", "DEVICE"
                );
                println!("{}", "-".repeat(96));
                for image in images {
                    println!(
                        "{:<24} {:>6}G {:<13} {:<18} {}",
                        image.name,
                        image.size_gb,
                        format!("{:?}", image.status).to_lowercase(),
                        image.assigned_to.as_deref().unwrap_or("-"),
                        image.target_name
                    );
                }
            }
            ImageCmd::Create { name, size_gb } => {
                let image: Image = self
                    .send(
                        client
                            .post(self.url("/api/v1/iscsi/images"))
                            .json(&serde_json::json!({ "name": name, "size_gb": size_gb })),
                    )
                    .await?;
                println!("Created {} ({} GiB) as {}", image.name, image.size_gb, image.target_name);
            }
            ImageCmd::Delete { name } => {
                self.call::<()>(client.delete(self.url(&format!("/api/v1/iscsi/images/{}", name))))
                    .await?;
                println!("Deleted {}", name);
            }
            ImageCmd::Copy { source, dest } => {
                let image: Image = self
                    .send(client.post(self.url(&format!(
                        "/api/v1/iscsi/images/{}/copy?dest_name={}",
                        source, dest
                    ))))
                    .await?;
                println!("Copied {} to {} ({} GiB)", source, image.name, image.size_gb);
            }
            ImageCmd::Rename { source, dest } => {
                let image: Image = self
                    .send(client.post(self.url(&format!(
                        "/api/v1/iscsi/images/{}/rename?dest_name={}",
                        source, dest
                    ))))
                    .await?;
                println!("Renamed {} to {}", source, image.name);
            }
            ImageCmd::Link { name, mac } => {
                let outcome: serde_json::Value = self
                    .send(client.post(self.url(&format!(
                        "/api/v1/iscsi/images/{}/link?mac={}",
                        name, mac
                    ))))
                    .await?;
                println!("Linked {} to {}", name, outcome["mac"].as_str().unwrap_or(mac));
                if let Some(url) = outcome["san_url"].as_str() {
                    println!("SAN URL: {}", url);
                }
            }
            ImageCmd::Unlink { name } => {
                let released: Option<String> = self
                    .call(client.post(self.url(&format!("/api/v1/iscsi/images/{}/unlink", name))))
                    .await?;
                match released {
                    Some(image) => println!("Unlinked {}", image),
                    None => println!("{} was not linked", name),
                }
            }
            ImageCmd::Metrics { name } => {
                let m: ImageMetrics = self
                    .send(client.get(self.url(&format!("/api/v1/iscsi/images/{}/metrics", name))))
                    .await?;
                let c = &m.connection;
                println!("Image: {} ({})", m.image, m.target_name);
                println!("Device: {}", m.assigned_to.as_deref().unwrap_or("-"));
                println!("Active: {} ({} sessions)", c.active, c.session_count);
                println!("Remote IPs: {}", Self::format_ips(&c.remote_ips));
                println!("Attribution: {:?}", c.attribution_confidence);
                println!(
                    "Disk read: {}  write: {}  ({:?})",
                    Self::format_bytes(c.disk_io.read),
                    Self::format_bytes(c.disk_io.write),
                    c.disk_io.source
                );
                if let Some(state) = m.stall_state {
                    println!(
                        "Stall state: {:?} ({}s without progress)",
                        state,
                        m.stall_seconds.unwrap_or(0)
                    );
                }
            }
        }
        Ok(())
    }

    async fn device(&self, cmd: &DeviceCmd) -> Result<()> {
        let client = Client::new();
        match cmd {
            DeviceCmd::List => {
                let devices: Vec<Device> = self.send(client.get(self.url("/api/v1/devices"))).await?;
                println!("{:<18} {:<6} {:<24} IMAGE", "MAC", "TYPE", "NAME");
                println!("{}", "-".repeat(72));
                for device in devices {
                    println!(
                        "{:<18} {:<6} {:<24} {}",
                        device.mac,
                        format!("{:?}", device.device_type).to_lowercase(),
                        device.name,
                        device.image_id.as_deref().unwrap_or("-")
                    );
                }
            }
            DeviceCmd::Register {
                mac,
                device_type,
                name,
            } => {
                let device: Device = self
                    .send(client.post(self.url("/api/v1/devices")).json(&serde_json::json!({
                        "mac": mac,
                        "device_type": device_type.to_lowercase(),
                        "name": name,
                    })))
                    .await?;
                println!("Registered {} as {}", device.mac, device.name);
            }
            DeviceCmd::Update {
                mac,
                name,
                device_type,
                enabled,
                kernel_set,
            } => {
                let device: Device = self
                    .send(
                        client
                            .put(self.url(&format!("/api/v1/devices/{}", mac)))
                            .json(&serde_json::json!({
                                "name": name,
                                "device_type": device_type.as_deref().map(str::to_lowercase),
                                "enabled": enabled,
                                "kernel_set": kernel_set,
                            })),
                    )
                    .await?;
                println!(
                    "Updated {} ({}, {})",
                    device.mac,
                    device.name,
                    if device.enabled { "enabled" } else { "disabled" }
                );
            }
            DeviceCmd::Delete { mac } => {
                let released: Option<String> = self
                    .call(client.delete(self.url(&format!("/api/v1/devices/{}", mac))))
                    .await?;
                match released {
                    Some(image) => println!("Deleted {}, released image {}", mac, image),
                    None => println!("Deleted {}", mac),
                }
            }
            DeviceCmd::ResetTransfer { mac } => {
                let state: serde_json::Value = self
                    .send(client.post(self.url(&format!("/api/v1/devices/{}/transfer/reset", mac))))
                    .await?;
                println!(
                    "Transfer counters reset, session {}",
                    state["session_id"].as_str().unwrap_or("-")
                );
            }
        }
        Ok(())
    }

    async fn logs(&self, mac: Option<&str>, limit: usize) -> Result<()> {
        let client = Client::new();
        let mut url = format!("/api/v1/boot/logs?limit={}", limit);
        if let Some(mac) = mac {
            url.push_str(&format!("&mac={}", mac));
        }
        let entries: Vec<BootLogEntry> = self.send(client.get(self.url(&url))).await?;

        for entry in entries {
            println!(
                "{} {:<18} {:<16} {:<15} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.mac,
                entry.event,
                entry.ip,
                entry.details
            );
        }
        Ok(())
    }

    fn format_ips(ips: &[IpAddr]) -> String {
        if ips.is_empty() {
            return "-".to_string();
        }
        ips.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(", ")
    }

    fn format_bytes(bytes: Option<u64>) -> String {
        let Some(bytes) = bytes else {
            return "n/a".to_string();
        };
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        format!("{:.1} {}", value, UNITS[unit])
    }
}
