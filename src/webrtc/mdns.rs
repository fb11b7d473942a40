use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::mdns::MulticastDnsMode;

/// Environment override for the ICE mDNS mode
pub const MDNS_MODE_ENV: &str = "CAM_RELAY_WEBRTC_MDNS_MODE";

pub fn parse_mdns_mode(raw: &str) -> Option<MulticastDnsMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "disabled" | "off" | "false" | "0" => Some(MulticastDnsMode::Disabled),
        "query" | "query_only" | "query-only" => Some(MulticastDnsMode::QueryOnly),
        "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
            Some(MulticastDnsMode::QueryAndGather)
        }
        _ => None,
    }
}

/// Mode from the environment, `QueryOnly` otherwise.
///
/// Browsers on the same LAN often offer `.local` candidates, so queries stay
/// on; gathering our own `.local` names is opt-in.
pub fn mdns_mode() -> MulticastDnsMode {
    std::env::var(MDNS_MODE_ENV)
        .ok()
        .and_then(|raw| parse_mdns_mode(&raw))
        .unwrap_or(MulticastDnsMode::QueryOnly)
}

pub fn mdns_mode_label(mode: MulticastDnsMode) -> &'static str {
    match mode {
        MulticastDnsMode::Disabled => "disabled",
        MulticastDnsMode::QueryOnly => "query_only",
        MulticastDnsMode::QueryAndGather => "query_and_gather",
    }
}

/// Setting engine for one relay session
pub fn setting_engine(session_id: &str) -> SettingEngine {
    let mut setting_engine = SettingEngine::default();
    let mode = mdns_mode();
    setting_engine.set_ice_multicast_dns_mode(mode);
    if mode == MulticastDnsMode::QueryAndGather {
        setting_engine.set_multicast_dns_host_name(format!("{session_id}.local"));
    }
    setting_engine
}
