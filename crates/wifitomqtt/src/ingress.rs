//! Inbound MQTT routing: `net/<iface>/...` topics to supplicant commands.

use tracing::info;

use tomqtt_core::publish::MqttSink;

use crate::bridge::WifiBridge;
use crate::station::{Mode, Network};

impl<S: MqttSink> WifiBridge<S> {
    /// Route one inbound message by its topic path.
    pub async fn handle_mqtt(&mut self, topic: &str, payload: &str) {
        let toks: Vec<&str> = topic.split('/').collect();
        if toks.len() < 4 || toks[0] != "net" || toks[1] != self.iface() {
            return;
        }
        match toks[2] {
            "ssid" => self.route_ssid(&toks, payload).await,
            "wifi" if toks[3] == "config" && toks.len() == 5 => {
                let key = toks[4].to_string();
                self.send(format!("SET {key} {payload}")).await;
            }
            "wifistate" if toks[3] == "set" => self.route_wifistate_set(payload).await,
            _ => {}
        }
    }

    async fn route_ssid(&mut self, toks: &[&str], payload: &str) {
        match toks[3] {
            "set" => {
                if payload.is_empty() || payload == "none" {
                    self.send("DISABLE_NETWORK all".into()).await;
                    self.st.selected_mode = None;
                } else if payload == "all" {
                    self.send("ENABLE_NETWORK all".into()).await;
                    self.st.selected_mode = None;
                } else {
                    let born_id = match self.st.networks.get_mut(payload) {
                        Some(net) => {
                            if net.id.is_none() {
                                net.pending_select = true;
                            }
                            net.id
                        }
                        None => {
                            info!(ssid = payload, "selected unknown network");
                            None
                        }
                    };
                    if let Some(id) = born_id {
                        self.send(format!("SELECT_NETWORK {id}")).await;
                    }
                }
            }
            "enable" => {
                let born_id = match self.st.networks.get_mut(payload) {
                    Some(net) => {
                        if net.id.is_none() {
                            // queue the flag already
                            net.disabled = false;
                        }
                        net.id
                    }
                    None => None,
                };
                if let Some(id) = born_id {
                    self.send(format!("ENABLE_NETWORK {id}")).await;
                }
                self.st.selected_mode = None;
            }
            "disable" => {
                let born_id = match self.st.networks.get_mut(payload) {
                    Some(net) => {
                        if net.id.is_none() {
                            net.disabled = true;
                        }
                        net.id
                    }
                    None => None,
                };
                if let Some(id) = born_id {
                    self.send(format!("DISABLE_NETWORK {id}")).await;
                }
                self.st.selected_mode = None;
            }
            "remove" => {
                let id = self.st.networks.get(payload).and_then(|n| n.id);
                if let Some(id) = id {
                    self.send(format!("REMOVE_NETWORK {id}")).await;
                    self.network_changed(payload, true);
                    self.st.networks.remove(payload);
                    self.nets_enabled_changed();
                } else if let Some(net) = self.st.networks.get_mut(payload) {
                    net.pending_remove = true;
                }
            }
            "psk" => {
                // payload: first line ssid, second line psk
                let mut lines = payload.lines();
                let (Some(ssid), Some(psk)) = (lines.next(), lines.next()) else {
                    self.publish_fail("malformed psk payload");
                    return;
                };
                if ssid.is_empty() {
                    self.publish_fail("malformed psk payload");
                    return;
                }
                #[cfg(feature = "no-plain-psk")]
                let psk = crate::psk::hash_if_quoted(psk, ssid);
                #[cfg(not(feature = "no-plain-psk"))]
                let psk = psk.to_string();
                let ssid = ssid.to_string();
                self.find_or_create_ssid(&ssid).await;
                self.add_network_config(&ssid, "psk", &psk).await;
            }
            "config" if toks.len() == 5 => {
                let key = toks[4].to_string();
                let mut lines = payload.lines();
                let (Some(ssid), Some(value)) = (lines.next(), lines.next()) else {
                    self.publish_fail("malformed config payload");
                    return;
                };
                let (ssid, value) = (ssid.to_string(), value.to_string());
                self.find_or_create_ssid(&ssid).await;
                self.add_network_config(&ssid, &key, &value).await;
            }
            "ap" => {
                if payload.is_empty() {
                    return;
                }
                let ssid = payload.to_string();
                self.find_or_create_ssid(&ssid).await;
                self.add_network_config(&ssid, "mode", "2").await;
                if self.noapbgscan() {
                    self.add_network_config(&ssid, "bgscan", "\"\"").await;
                }
                if let Some(net) = self.st.networks.get_mut(&ssid) {
                    net.mode = Mode::Ap;
                    if net.id.is_none() {
                        // leave new AP networks disabled
                        net.disabled = true;
                    }
                }
            }
            "mesh" => {
                if payload.is_empty() {
                    return;
                }
                let ssid = payload.to_string();
                self.find_or_create_ssid(&ssid).await;
                self.add_network_config(&ssid, "mode", "5").await;
                if self.noapbgscan() {
                    self.add_network_config(&ssid, "bgscan", "\"\"").await;
                }
                let pending = self
                    .st
                    .networks
                    .get(&ssid)
                    .map_or(false, |n| n.id.is_none());
                if let Some(net) = self.st.networks.get_mut(&ssid) {
                    net.mode = Mode::Mesh;
                }
                if pending {
                    self.add_network_config(&ssid, "key_mgmt", "NONE").await;
                    self.add_network_config(&ssid, "frequency", "2437").await;
                    if let Some(net) = self.st.networks.get_mut(&ssid) {
                        // leave new mesh networks disabled
                        net.disabled = true;
                    }
                }
            }
            "create" => {
                if !payload.is_empty() {
                    let ssid = payload.to_string();
                    self.find_or_create_ssid(&ssid).await;
                }
            }
            _ => {}
        }
    }

    async fn route_wifistate_set(&mut self, payload: &str) {
        if payload == "off" {
            self.send("DISABLE_NETWORK all".into()).await;
            self.st.selected_mode = None;
        } else if payload == "any" {
            self.send("ENABLE_NETWORK all".into()).await;
            self.st.selected_mode = None;
        } else if let Some(mode) = Mode::parse(payload) {
            self.st.selected_mode = Some(mode);
            info!(mode = mode.state_name(), "wifi mode selected");
            // disable all networks, enable those of the new mode
            let actions: Vec<(String, Option<u32>, Mode, bool)> = self
                .st
                .networks
                .values()
                .map(|n| (n.ssid.clone(), n.id, n.mode, n.disabled))
                .collect();
            for (ssid, id, nmode, disabled) in actions {
                match id {
                    None => {
                        if let Some(net) = self.st.networks.get_mut(&ssid) {
                            net.disabled = nmode != mode;
                        }
                    }
                    Some(id) => {
                        if nmode == mode && disabled {
                            self.send(format!("ENABLE_NETWORK {id}")).await;
                        } else if nmode != mode && !disabled {
                            self.send(format!("DISABLE_NETWORK {id}")).await;
                        }
                    }
                }
            }
            // clear current ssid before the new wifistate acks
            self.publish_state("ssid", "");
            self.set_wifi_state(mode.state_name());
        } else {
            info!(mode = payload, "unknown wifi mode");
        }
    }

    /// Known network, or a pending creation started right here.
    pub(crate) async fn find_or_create_ssid(&mut self, ssid: &str) {
        if !self.st.networks.contains_key(ssid) {
            self.send("ADD_NETWORK".into()).await;
            let seq = self.st.next_create_seq();
            self.st
                .networks
                .insert(ssid.to_string(), Network::pending(seq, ssid));
        }
    }

    /// Apply a config key now, or hold it until the id is assigned.
    pub(crate) async fn add_network_config(&mut self, ssid: &str, key: &str, value: &str) {
        match self.st.networks.get(ssid).and_then(|n| n.id) {
            Some(id) => self.send(format!("SET_NETWORK {id} {key} {value}")).await,
            None => {
                if let Some(net) = self.st.networks.get_mut(ssid) {
                    net.pending_cfg.push((key.to_string(), value.to_string()));
                }
            }
        }
    }
}
