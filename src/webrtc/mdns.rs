use webrtc::ice::mdns::MulticastDnsMode;

/// Parse a configured mDNS mode; `None` for unrecognised values
pub fn parse_mdns_mode(raw: &str) -> Option<MulticastDnsMode> {
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }

    match value.as_str() {
        "disabled" | "off" | "false" | "0" => Some(MulticastDnsMode::Disabled),
        "query" | "query_only" | "query-only" => Some(MulticastDnsMode::QueryOnly),
        "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
            Some(MulticastDnsMode::QueryAndGather)
        }
        _ => None,
    }
}

/// Configured mode, QueryOnly unless set otherwise
pub fn mdns_mode(raw: &str) -> MulticastDnsMode {
    // Gathering .local host candidates tends to slow down the first LAN connection
    parse_mdns_mode(raw).unwrap_or(MulticastDnsMode::QueryOnly)
}

pub fn mdns_mode_label(mode: MulticastDnsMode) -> &'static str {
    match mode {
        MulticastDnsMode::Disabled => "disabled",
        MulticastDnsMode::QueryOnly => "query_only",
        MulticastDnsMode::QueryAndGather => "query_and_gather",
    }
}

pub fn mdns_host_name(peer_id: &str) -> String {
    format!("{}-{}.local", peer_id, &uuid::Uuid::new_v4().simple().to_string()[..8])
}
