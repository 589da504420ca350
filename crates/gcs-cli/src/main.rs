use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gcs_link::autodetect::autodetect_fc;
use gcs_link::doctor as link_doctor;
use gcs_link::{ConnectTarget, ConnectionManager, LinkConfig, LinkListener, ParameterTable};
use gcs_proto::telemetry::ParamSyncState;

use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "gcs", version, about = "MAVLink ground-station link")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
    /// Connect, print one status report and exit.
    Status,
    /// Stream telemetry until ctrl-c.
    Monitor,
    Params { #[command(subcommand)] cmd: ParamsCmd },
    /// Send a named MAV_CMD and wait for its ACK.
    Command {
        name: String,
        /// Up to seven command parameters; missing ones are 0.
        #[arg(allow_negative_numbers = true)]
        params: Vec<f32>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum ParamsCmd {
    /// Download the full table and print it as JSON.
    Dump {
        #[arg(long)]
        categorized: bool,
        #[arg(long)]
        out: Option<String>,
    },
    /// Compare the live table against a previous `dump`.
    Diff { previous: String },
    /// Write one parameter and wait for the vehicle's echo.
    Set { name: String, value: f32 },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    link: LinkConfig,
    monitor: MonitorCfg,
    log: LogCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct MonitorCfg {
    fast_hz: f32,
    slow_hz: f32,
    json: bool,
}

impl Default for MonitorCfg {
    fn default() -> Self {
        Self { fast_hz: 20.0, slow_hz: 2.0, json: false }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct LogCfg {
    level: String,
}

impl Default for LogCfg {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

/// Logs link events; the CLI has nothing else to do with them.
struct LogListener;

impl LinkListener for LogListener {
    fn on_parameters_complete(&self, table: &ParameterTable) {
        info!("params: table complete ({} entries)", table.len());
    }

    fn on_heartbeat_lost(&self) {
        warn!("vehicle heartbeat lost");
    }

    fn on_heartbeat_restored(&self) {
        info!("vehicle heartbeat restored");
    }

    fn on_disconnected(&self, reason: &str) {
        warn!("link down: {}", reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Autodetect => autodetect(&cfg).await,
        Command::Status => status(&cfg).await,
        Command::Monitor => monitor(&cfg).await,
        Command::Params { cmd } => params_cmd(&cfg, cmd).await,
        Command::Command { name, params, timeout_ms } => command(&cfg, name, params, timeout_ms).await,
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    link_doctor::check_link_config(&cfg.link)?;
    link_doctor::check_target(&cfg.link)?;
    anyhow::ensure!(cfg.monitor.fast_hz > 0.0 && cfg.monitor.fast_hz <= 100.0, "monitor.fast_hz should be 0..100");
    anyhow::ensure!(cfg.monitor.slow_hz > 0.0 && cfg.monitor.slow_hz <= cfg.monitor.fast_hz, "monitor.slow_hz should be 0..fast_hz");
    if cfg.link.target.is_none() {
        info!("doctor: no link.target, autodetect will be used (OK)");
    }
    info!("doctor: OK");
    Ok(())
}

async fn autodetect(cfg: &Config) -> Result<()> {
    let link = cfg.link.clone();
    let res = tokio::task::spawn_blocking(move || autodetect_fc(&link, Duration::from_millis(1500))).await??;
    if let Some((dev, baud)) = &res.chosen {
        println!("CHOSEN: {} @ {}", dev, baud);
    } else {
        println!("CHOSEN: none");
    }
    for p in res.probes {
        println!("probe dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note);
    }
    Ok(())
}

fn resolve_target(link: &LinkConfig) -> Result<ConnectTarget> {
    if let Some(target) = link.connect_target().context("link.target")? {
        return Ok(target);
    }
    anyhow::ensure!(link.autodetect, "link.target missing (autodetect=false)");
    let res = autodetect_fc(link, link.connect_timeout().min(Duration::from_secs(2)))?;
    res.target().context("fc autodetect failed: no heartbeat found")
}

async fn connect(cfg: &Config) -> Result<Arc<ConnectionManager>> {
    let manager = Arc::new(ConnectionManager::new(cfg.link.clone()));
    manager.add_listener(Arc::new(LogListener));

    let m = manager.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let target = resolve_target(m.config())?;
        let info = m.connect(&target).with_context(|| format!("connect {}", target))?;
        println!(
            "connected: {} sys={} comp={} {} {}",
            info.transport, info.target_system, info.target_component, info.autopilot, info.vehicle_type
        );
        if let Err(e) = m.request_data_streams(m.config().stream_rate_hz) {
            warn!("stream request failed: {}", e);
        }
        if let Err(e) = m.request_autopilot_version() {
            warn!("autopilot version request failed: {}", e);
        }
        Ok(())
    })
    .await??;
    Ok(manager)
}

async fn disconnect(manager: Arc<ConnectionManager>) -> Result<()> {
    tokio::task::spawn_blocking(move || manager.disconnect()).await?;
    Ok(())
}

async fn status(cfg: &Config) -> Result<()> {
    let manager = connect(cfg).await?;
    // Let a couple of stream periods and latency probes land.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let report = manager.status_report();
    if cfg.monitor.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("state={:?} mode={:?} armed={:?}", report.state, report.flight_mode, report.armed);
        println!(
            "battery={:?}V {:?}% {:?}A gps={:?} sats={:?}",
            report.battery_voltage, report.battery_percent, report.battery_current, report.gps_fix, report.satellites
        );
        println!("link={:.1} pkt/s {:.0} B/s rtt={:.1}ms", report.link.packets_per_sec, report.link.bytes_per_sec, report.latency.avg_ms);
        if let Some(fw) = manager.firmware_info() {
            println!("firmware={} caps={}", fw.version_string(), fw.capabilities.join(","));
        }
        if let Some(info) = manager.session_info() {
            println!("uptime={:?} last_heartbeat_age={:?}", info.uptime(), info.hb_age());
        }
    }
    disconnect(manager).await
}

async fn monitor(cfg: &Config) -> Result<()> {
    let manager = connect(cfg).await?;
    if let Err(e) = request_parameters(&manager).await {
        warn!("param request failed: {:#}", e);
    }

    let mut fast = tokio::time::interval(Duration::from_secs_f32(1.0 / cfg.monitor.fast_hz.max(0.1)));
    let mut slow = tokio::time::interval(Duration::from_secs_f32(1.0 / cfg.monitor.slow_hz.max(0.1)));
    fast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    slow.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("monitor: ctrl-c");
                break;
            }
            _ = fast.tick() => {
                let snap = manager.snapshot();
                if cfg.monitor.json {
                    println!("{}", serde_json::json!({ "attitude": snap.attitude(), "hud": snap.hud() }));
                } else if let (Some(att), Some(hud)) = (snap.attitude(), snap.hud()) {
                    println!(
                        "att r={:.1} p={:.1} y={:.1} alt={:.1}m gs={:.1}m/s",
                        att.roll, att.pitch, att.yaw, hud.alt, hud.groundspeed
                    );
                }
            }
            _ = slow.tick() => {
                let report = manager.status_report();
                if cfg.monitor.json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!(
                        "[{:?}] mode={:?} armed={:?} bat={:?}V params={}/{} rtt={:.1}ms {:.1} pkt/s",
                        report.state,
                        report.flight_mode,
                        report.armed,
                        report.battery_voltage,
                        report.params.received,
                        report.params.expected,
                        report.latency.current_ms,
                        report.link.packets_per_sec
                    );
                }
                if !manager.is_connected() {
                    warn!("monitor: link is down");
                    break;
                }
            }
        }
    }
    disconnect(manager).await
}

/// Link writes can block on a serial port; keep them off the runtime threads.
async fn request_parameters(manager: &Arc<ConnectionManager>) -> Result<()> {
    let m = manager.clone();
    tokio::task::spawn_blocking(move || m.request_parameters()).await?.context("request parameters")
}

/// Request the full table and wait for it to complete or stall.
async fn download(manager: &Arc<ConnectionManager>) -> Result<ParameterTable> {
    request_parameters(manager).await?;
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let p = manager.param_progress();
        match manager.param_sync_status() {
            Ok(ParamSyncState::Complete) => return Ok(manager.get_parameters()),
            Ok(_) => info!("params: {}/{} ({:.0}%)", p.received, p.expected, p.percent),
            Err(e) => anyhow::bail!(e),
        }
        anyhow::ensure!(manager.is_connected(), "link lost during parameter download");
    }
}

async fn params_cmd(cfg: &Config, cmd: ParamsCmd) -> Result<()> {
    let manager = connect(cfg).await?;
    let result = match cmd {
        ParamsCmd::Dump { categorized, out } => {
            let table = download(&manager).await?;
            let text = if categorized {
                serde_json::to_string_pretty(&manager.get_parameters_categorized())?
            } else {
                serde_json::to_string_pretty(&table)?
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, text).with_context(|| format!("write {}", path))?;
                    info!("params: wrote {} entries to {}", table.len(), path);
                }
                None => println!("{}", text),
            }
            Ok(())
        }
        ParamsCmd::Diff { previous } => {
            let s = std::fs::read_to_string(&previous).with_context(|| format!("read {}", previous))?;
            let before: ParameterTable = serde_json::from_str(&s).context("parse previous table")?;
            download(&manager).await?;
            let delta = manager.parameter_delta(&before);
            if delta.is_empty() {
                println!("no changes");
            }
            for (name, change) in delta.iter() {
                println!("{:<16} {:?} -> {:?}", name, change.old, change.new);
            }
            Ok(())
        }
        ParamsCmd::Set { name, value } => {
            let (m, n) = (manager.clone(), name.clone());
            tokio::task::spawn_blocking(move || m.update_parameter(&n, value))
                .await?
                .with_context(|| format!("set {}", name))?;
            let mut echoed = false;
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if manager.get_parameters().get(&name) == Some(value) {
                    echoed = true;
                    break;
                }
            }
            if echoed {
                println!("{} = {}", name, value);
            } else {
                warn!("params: no echo for {} yet; the table only changes when the vehicle confirms", name);
            }
            Ok(())
        }
    };
    disconnect(manager).await?;
    result
}

async fn command(cfg: &Config, name: String, params: Vec<f32>, timeout_ms: Option<u64>) -> Result<()> {
    anyhow::ensure!(params.len() <= 7, "at most 7 command parameters");
    let mut p = [0.0f32; 7];
    p[..params.len()].copy_from_slice(&params);

    let manager = connect(cfg).await?;
    let m = manager.clone();
    let timeout = timeout_ms.map(Duration::from_millis);
    let label = name.clone();
    let outcome = tokio::task::spawn_blocking(move || m.send_command(&name, p, timeout)).await?;
    disconnect(manager).await?;

    match outcome {
        Ok(status) => {
            println!("ack: {:?}", status);
            Ok(())
        }
        Err(e) if e.is_vehicle_answer() => anyhow::bail!("vehicle refused {}: {}", label, e),
        Err(e) => Err(e).with_context(|| format!("{} got no answer", label)),
    }
}
