use anyhow::{Context, Result};

use crate::LinkConfig;

pub fn check_link_config(cfg: &LinkConfig) -> Result<()> {
    anyhow::ensure!(cfg.sys_id != 0, "link.sys_id must be non-zero");
    anyhow::ensure!(cfg.recv_timeout_ms >= 10 && cfg.recv_timeout_ms <= 2_000, "link.recv_timeout_ms should be 10..2000");
    anyhow::ensure!(
        cfg.heartbeat_timeout_ms >= 1_000 && cfg.heartbeat_timeout_ms <= 60_000,
        "link.heartbeat_timeout_ms should be 1000..60000"
    );
    anyhow::ensure!(cfg.connect_timeout_ms >= 1_000, "link.connect_timeout_ms too small");
    anyhow::ensure!(cfg.command_timeout_ms >= 100, "link.command_timeout_ms too small");
    anyhow::ensure!(cfg.latency_probe_ms >= 100, "link.latency_probe_ms too small");
    anyhow::ensure!(cfg.param_stall_timeout_ms >= 500, "link.param_stall_timeout_ms too small");
    anyhow::ensure!(cfg.stream_rate_hz >= 1 && cfg.stream_rate_hz <= 50, "link.stream_rate_hz should be 1..50");
    Ok(())
}

pub fn check_target(cfg: &LinkConfig) -> Result<()> {
    match cfg.connect_target().context("link.target")? {
        Some(_) => Ok(()),
        None => {
            anyhow::ensure!(cfg.autodetect, "link.target unset and link.autodetect disabled");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_but_need_a_target() {
        let cfg = LinkConfig::default();
        check_link_config(&cfg).unwrap();
        assert!(check_target(&cfg).is_err());

        let cfg = LinkConfig { target: Some("udpin:0.0.0.0:14550".into()), ..LinkConfig::default() };
        check_target(&cfg).unwrap();
    }

    #[test]
    fn out_of_range_values_are_flagged() {
        let cfg = LinkConfig { heartbeat_timeout_ms: 100, ..LinkConfig::default() };
        let err = check_link_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("heartbeat_timeout_ms"));

        let cfg = LinkConfig { target: Some("wss://fc.example/ws".into()), ..LinkConfig::default() };
        assert!(check_target(&cfg).is_err());
    }
}
