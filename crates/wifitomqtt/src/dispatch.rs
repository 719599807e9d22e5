//! Record classification and handlers for the supplicant dialect.
//!
//! A datagram starting with `<N>` (N in 2..4, the syslog level) is an
//! unsolicited event; anything else answers the head of the command FIFO.
//! URCs never advance the queue. Responses are correlated by re-parsing
//! the head command string.

use tracing::{info, warn};

use tomqtt_core::publish::MqttSink;

use crate::bridge::{WifiBridge, WifiTimer};
use crate::station::{freq_ghz, Bss, BssFlags, Mode, Network};

/// Strip the URC sigil; `None` means the record is a command response.
fn strip_urc_sigil(record: &str) -> Option<&str> {
    for sigil in ["<2>", "<3>", "<4>"] {
        if let Some(rest) = record.strip_prefix(sigil) {
            return Some(rest);
        }
    }
    None
}

impl<S: MqttSink> WifiBridge<S> {
    /// Process one datagram from the control socket.
    pub async fn handle_datagram(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let text = text.strip_suffix('\n').unwrap_or(&text);

        if let Some(urc) = strip_urc_sigil(text) {
            // Raw passthrough of every event, non-retained.
            let topic = format!("tmp/{}/wpa", self.iface());
            self.sink.publish(&topic, urc, false);
            self.handle_urc(urc).await;
            return;
        }

        let Some(head) = self.queue.complete_head() else {
            warn!(record = text, "unsolicited response");
            return;
        };
        self.timers.remove(&WifiTimer::CmdTimeout);
        self.handle_response(&head.line, text).await;
        self.write_head().await;
    }

    /// Dispatch an unsolicited event by its first token.
    pub(crate) async fn handle_urc(&mut self, line: &str) {
        let mut toks = line.split_whitespace();
        let Some(event) = toks.next() else {
            return;
        };
        match event {
            "CTRL-EVENT-CONNECTED" => {
                if self.st.curr_mode == Mode::Station {
                    // only station state when not up as AP or mesh
                    self.set_wifi_state("station");
                    self.send("SIGNAL_POLL".into()).await;
                }
                self.send("STATUS".into()).await;
            }
            "CTRL-EVENT-DISCONNECTED" => {
                self.send("STATUS".into()).await;
                self.set_wifi_state("none");
            }
            "AP-ENABLED" => {
                self.st.curr_mode = Mode::Ap;
                self.set_wifi_state("AP");
                self.set_stations(0);
            }
            "AP-DISABLED" => {
                self.st.curr_mode = Mode::Station;
                self.send("SCAN".into()).await;
                self.set_stations(-1);
            }
            "AP-STA-CONNECTED" | "MESH-PEER-CONNECTED" => {
                let n = self.st.nstations;
                self.set_stations(n + 1);
            }
            "AP-STA-DISCONNECTED" | "MESH-PEER-DISCONNECTED" => {
                let n = self.st.nstations;
                self.set_stations(n - 1);
            }
            "MESH-GROUP-STARTED" => {
                self.st.curr_mode = Mode::Mesh;
                self.set_wifi_state("mesh");
                self.set_stations(0);
            }
            "MESH-GROUP-REMOVED" => {
                self.st.curr_mode = Mode::Station;
                self.set_stations(-1);
            }
            "CTRL-EVENT-BSS-ADDED" => {
                toks.next();
                if let Some(bssid) = toks.next() {
                    let bssid = bssid.to_string();
                    self.send(format!("BSS {bssid}")).await;
                }
                self.st.have_bss_events = true;
            }
            "CTRL-EVENT-BSS-REMOVED" => {
                toks.next();
                if let Some(bssid) = toks.next() {
                    let bssid = bssid.to_string();
                    self.st.bsss.remove(&bssid);
                    self.hide_bss(&bssid);
                }
                self.st.have_bss_events = true;
            }
            "CTRL-EVENT-SCAN-RESULTS" => {
                // Prefer the event-driven per-BSS path once it proved alive.
                if !self.st.have_bss_events {
                    self.send("SCAN_RESULTS".into()).await;
                }
            }
            _ => {}
        }
    }

    /// Handle the reply to `cmd`.
    pub(crate) async fn handle_response(&mut self, cmd: &str, body: &str) {
        if body == "FAIL" || body == "UNKNOWN COMMAND" {
            if cmd.starts_with("STA-NEXT ") || cmd == "STA-FIRST" {
                // station discovery reports FAIL at end-of-list
                return;
            }
            let word = cmd.split_whitespace().next().unwrap_or(cmd);
            warn!(cmd, body, "command failed");
            let truncated: String = body.chars().take(30).collect();
            self.publish_fail(&format!("'{word}': {truncated}"));
            return;
        }
        if body.is_empty() {
            info!(cmd, "empty response");
            return;
        }

        if cmd == "ATTACH" {
            info!("supplicant attached");
            self.send("LIST_NETWORKS".into()).await;
            self.send("SCAN_RESULTS".into()).await;
            self.send("STATUS".into()).await;
            self.send("SCAN".into()).await;
        } else if let Some(rest) = cmd.strip_prefix("GET_NETWORK ") {
            self.on_get_network(rest, body).await;
        } else if let Some(rest) = cmd.strip_prefix("SET_NETWORK ") {
            self.on_set_network(rest).await;
        } else if cmd == "LIST_NETWORKS" {
            self.on_list_networks(body).await;
        } else if cmd == "SCAN_RESULTS" {
            self.on_scan_results(body).await;
        } else if cmd.starts_with("BSS ") {
            self.on_bss(body).await;
        } else if cmd == "SIGNAL_POLL" {
            for line in body.lines() {
                let Some((key, val)) = line.split_once('=') else {
                    continue;
                };
                if key.eq_ignore_ascii_case("rssi") {
                    self.publish_rssi(val);
                } else if key.eq_ignore_ascii_case("linkspeed") {
                    self.publish_speed(val);
                }
            }
        } else if cmd == "STATUS" {
            self.on_status(body).await;
        } else if cmd == "STA-FIRST" {
            self.set_stations(1);
            if let Some(sta) = body.lines().next() {
                let sta = sta.to_string();
                self.send(format!("STA-NEXT {sta}")).await;
            }
        } else if cmd.starts_with("STA-NEXT") {
            let n = self.st.nstations;
            self.set_stations(n + 1);
            if let Some(sta) = body.lines().next() {
                let sta = sta.to_string();
                self.send(format!("STA-NEXT {sta}")).await;
            }
        } else if cmd.starts_with("ADD_NETWORK") {
            self.on_add_network(body).await;
        } else if cmd == "ENABLE_NETWORK all" {
            self.on_all_networks(false).await;
        } else if cmd == "DISABLE_NETWORK all" {
            self.on_all_networks(true).await;
        } else if let Some(rest) = cmd.strip_prefix("ENABLE_NETWORK ") {
            self.on_network_enabled(rest, false).await;
        } else if let Some(rest) = cmd.strip_prefix("DISABLE_NETWORK ") {
            self.on_network_enabled(rest, true).await;
        } else if cmd.starts_with("REMOVE_NETWORK") {
            self.save_config_maybe().await;
        } else if let Some(rest) = cmd.strip_prefix("SELECT_NETWORK ") {
            self.on_select_network(rest).await;
        } else if cmd == "PING" {
            // pong
        } else if cmd.starts_with("SET ") {
            self.save_config_maybe().await;
        } else {
            info!(cmd, "ok");
        }
    }

    async fn on_get_network(&mut self, rest: &str, body: &str) {
        let mut fields = rest.split_whitespace();
        let Some(id) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
            return;
        };
        let name = fields.next().unwrap_or("");

        let Some(net) = self.st.network_by_id_mut(id) else {
            return;
        };
        let ssid = net.ssid.clone();
        match name {
            "mode" => {
                net.mode = Mode::from_raw(body.trim().parse().unwrap_or(0));
                self.network_changed(&ssid, false);
            }
            "disabled" => {
                net.disabled = body.trim().parse::<u32>().unwrap_or(0) != 0;
                self.nets_enabled_changed();
                self.network_changed(&ssid, false);
            }
            _ => {}
        }
    }

    async fn on_set_network(&mut self, rest: &str) {
        let mut fields = rest.split_whitespace();
        let Some(id) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
            return;
        };
        let prop = fields.next().unwrap_or("");
        let value = fields.next().unwrap_or("");

        if let Some(net) = self.st.network_by_id_mut(id) {
            let ssid = net.ssid.clone();
            match prop {
                "mode" => {
                    net.mode = Mode::from_raw(value.parse().unwrap_or(0));
                    self.network_changed(&ssid, false);
                }
                "disabled" => {
                    net.disabled = value == "1";
                    self.nets_enabled_changed();
                    self.network_changed(&ssid, false);
                }
                _ => {}
            }
        }
        self.save_config_maybe().await;
    }

    async fn on_list_networks(&mut self, body: &str) {
        // Rebuild the set; entries still awaiting ADD_NETWORK stay.
        self.st.networks.retain(|_, net| net.id.is_none());

        for line in body.lines() {
            if line.starts_with("network id") {
                continue;
            }
            let mut fields = line.split('\t');
            let Some(id) = fields.next().and_then(|f| f.trim().parse::<u32>().ok()) else {
                continue;
            };
            let ssid = fields.next().unwrap_or("").to_string();
            if self.st.networks.contains_key(&ssid) {
                warn!(ssid, id, "removing duplicate ssid");
                self.send(format!("REMOVE_NETWORK {id}")).await;
                continue;
            }
            self.st
                .networks
                .insert(ssid.clone(), Network::born(id, &ssid));
            self.send(format!("GET_NETWORK {id} disabled")).await;
            self.send(format!("GET_NETWORK {id} mode")).await;
        }
    }

    /// Full-scan reconciliation: everything in the reply is (re)fetched,
    /// everything absent from it is dropped and its topics cleared.
    async fn on_scan_results(&mut self, body: &str) {
        for bss in self.st.bsss.values_mut() {
            bss.flags.present = false;
        }

        for line in body.lines() {
            if line.starts_with("bssid") {
                continue;
            }
            let Some(bssid) = line.split('\t').next() else {
                continue;
            };
            if bssid.is_empty() {
                continue;
            }
            let bssid = bssid.to_string();
            self.send(format!("BSS {bssid}")).await;
            if let Some(bss) = self.st.bsss.get_mut(&bssid) {
                bss.flags.present = true;
            }
        }

        let stale: Vec<String> = self
            .st
            .bsss
            .values()
            .filter(|b| !b.flags.present)
            .map(|b| b.bssid.clone())
            .collect();
        for bssid in stale {
            self.hide_bss(&bssid);
            self.st.bsss.remove(&bssid);
        }
    }

    async fn on_bss(&mut self, body: &str) {
        let mut bssid = None;
        let mut ssid = None;
        let mut flags_field = None;
        let mut freq = 0u32;
        let mut level = 0i32;
        for line in body.lines() {
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            match key {
                "bssid" => bssid = Some(val.to_string()),
                "freq" => freq = val.parse().unwrap_or(0),
                "level" => level = val.parse().unwrap_or(0),
                "flags" => flags_field = Some(val.to_string()),
                "ssid" => ssid = Some(val.to_string()),
                _ => {}
            }
        }
        if let Some(s) = &ssid {
            if s.starts_with("\\x00") {
                // most probably a hidden ssid
                return;
            }
        }
        let Some(bssid) = bssid else {
            return;
        };

        let mut publishes: Vec<(&'static str, String)> = Vec::new();
        if let Some(bss) = self.st.bsss.get_mut(&bssid) {
            if bss.freq != freq {
                publishes.push(("freq", freq_ghz(freq)));
            }
            if bss.level != level {
                publishes.push(("level", level.to_string()));
            }
            bss.freq = freq;
            bss.level = level;
            let before = bss.flags;
            if let Some(f) = &flags_field {
                bss.flags.set_security(f);
            }
            if before != bss.flags {
                publishes.push(("flags", bss.flags.render()));
            }
        } else {
            let mut bss = Bss {
                bssid: bssid.clone(),
                ssid: ssid.clone().unwrap_or_default(),
                freq,
                level,
                flags: BssFlags::default(),
            };
            if let Some(f) = &flags_field {
                bss.flags.set_security(f);
            }
            if !bss.ssid.is_empty() {
                let net = self.st.networks.get(&bss.ssid);
                bss.flags.set_network(net);
            }
            publishes.push(("ssid", bss.ssid.clone()));
            publishes.push(("freq", freq_ghz(freq)));
            publishes.push(("level", level.to_string()));
            // flags as last
            publishes.push(("flags", bss.flags.render()));
            self.st.bsss.insert(bssid.clone(), bss);
        }
        for (name, value) in publishes {
            self.publish_bss(&bssid, name, &value);
        }

        if self.st.curr_mode == Mode::Station && self.st.curr_bssid == bssid {
            if level != self.st.curr_level {
                self.publish_state("level", &level.to_string());
            }
            self.st.curr_level = level;
        }
    }

    async fn on_status(&mut self, body: &str) {
        let mut ssid = String::new();
        let mut mode = String::new();
        let mut wpa_state = String::new();
        let mut freq = 0u32;

        self.st.curr_bssid.clear();
        for line in body.lines() {
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            match key {
                "bssid" => self.st.curr_bssid = val.to_string(),
                "ssid" => ssid = val.to_string(),
                "freq" => freq = val.parse().unwrap_or(0),
                "mode" => mode = val.to_string(),
                "wpa_state" => wpa_state = val.to_string(),
                _ => {}
            }
        }
        if self.st.curr_bssid == "00:00:00:00:00:00" {
            self.st.curr_bssid.clear();
        }

        if self.st.published_state.is_none() {
            // first iteration after start-up, fix mode and wifi state
            match mode.as_str() {
                "AP" => self.st.curr_mode = Mode::Ap,
                "mesh" => self.st.curr_mode = Mode::Mesh,
                _ => {}
            }
            match self.st.curr_mode {
                Mode::Ap => {
                    self.set_wifi_state("AP");
                    self.send("STA-FIRST".into()).await;
                    self.set_stations(0);
                }
                Mode::Mesh => self.set_wifi_state("mesh"),
                Mode::Station => {
                    if wpa_state == "COMPLETED" && mode == "station" {
                        self.set_wifi_state("station");
                        self.publish_state("stations", "");
                    } else {
                        self.set_wifi_state("none");
                    }
                }
            }
        }

        let curr_bssid = self.st.curr_bssid.clone();
        self.publish_state("bssid", &curr_bssid);
        if freq != 0 && self.st.curr_mode != Mode::Station {
            self.publish_state("freq", &freq_ghz(freq));
            self.publish_state("level", "");
            self.publish_state("ssid", &ssid);
        } else if freq != 0 && !curr_bssid.is_empty() {
            self.publish_state("freq", &freq_ghz(freq));
            if let Some(level) = self.st.bsss.get(&curr_bssid).map(|b| b.level) {
                if self.st.curr_level != level {
                    self.publish_state("level", &level.to_string());
                }
                self.st.curr_level = level;
            }
            self.publish_state("ssid", &ssid);
        } else {
            self.publish_state("freq", "");
            self.publish_state("level", "");
            self.publish_state("ssid", "");
            self.st.curr_level = 0;
        }
    }

    /// Pair an ADD_NETWORK reply with the oldest pending creation and
    /// replay everything queued against it.
    async fn on_add_network(&mut self, body: &str) {
        let Ok(id) = body.trim().parse::<u32>() else {
            return;
        };
        let (oldest, npending) = self.st.oldest_pending();
        if npending <= 1 {
            // nothing else pending, avoid counter growth
            self.st.create_seq = 0;
        }
        let Some(ssid) = oldest else {
            return;
        };

        let Some(net) = self.st.networks.get_mut(&ssid) else {
            return;
        };
        net.id = Some(id);
        let cfgs = std::mem::take(&mut net.pending_cfg);
        let pending_remove = net.pending_remove;
        let pending_select = net.pending_select;
        let disabled = net.disabled;
        net.pending_remove = false;
        net.pending_select = false;

        if pending_remove {
            self.send(format!("REMOVE_NETWORK {id}")).await;
            self.network_changed(&ssid, true);
            self.st.networks.remove(&ssid);
            self.nets_enabled_changed();
            return;
        }

        self.send(format!("SET_NETWORK {id} ssid \"{ssid}\"")).await;
        for (key, value) in cfgs {
            self.send(format!("SET_NETWORK {id} {key} {value}")).await;
        }
        if pending_select {
            self.send(format!("SELECT_NETWORK {id}")).await;
        } else if !disabled {
            // enable station-mode networks automatically
            self.send(format!("ENABLE_NETWORK {id}")).await;
        }
        self.nets_enabled_changed();
    }

    async fn on_all_networks(&mut self, disabled: bool) {
        let changed: Vec<String> = self
            .st
            .networks
            .values()
            .filter(|n| n.disabled != disabled)
            .map(|n| n.ssid.clone())
            .collect();
        for ssid in changed {
            if let Some(net) = self.st.networks.get_mut(&ssid) {
                net.disabled = disabled;
            }
            self.network_changed(&ssid, false);
        }
        self.save_config_maybe().await;
        self.nets_enabled_changed();
    }

    async fn on_network_enabled(&mut self, rest: &str, disabled: bool) {
        let Ok(id) = rest.trim().parse::<u32>() else {
            return;
        };
        let Some(net) = self.st.network_by_id_mut(id) else {
            return;
        };
        net.disabled = disabled;
        let ssid = net.ssid.clone();
        self.network_changed(&ssid, false);
        self.save_config_maybe().await;
        self.nets_enabled_changed();
    }

    async fn on_select_network(&mut self, rest: &str) {
        let Ok(id) = rest.trim().parse::<u32>() else {
            return;
        };
        let all: Vec<(String, bool)> = self
            .st
            .networks
            .values()
            .map(|n| (n.ssid.clone(), n.id == Some(id)))
            .collect();
        for (ssid, selected) in all {
            if let Some(net) = self.st.networks.get_mut(&ssid) {
                net.disabled = !selected;
            }
            self.network_changed(&ssid, false);
        }
        self.save_config_maybe().await;
        self.nets_enabled_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urc_sigil_levels() {
        assert_eq!(
            strip_urc_sigil("<3>CTRL-EVENT-CONNECTED"),
            Some("CTRL-EVENT-CONNECTED")
        );
        assert_eq!(strip_urc_sigil("<2>warning"), Some("warning"));
        assert_eq!(strip_urc_sigil("<4>oops"), Some("oops"));
        assert_eq!(strip_urc_sigil("OK"), None);
        assert_eq!(strip_urc_sigil("<5>too quiet"), None);
    }
}
