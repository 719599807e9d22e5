//! Domain model: configured networks, scan-observed BSSes, aggregates.
//!
//! Networks are keyed by SSID, BSSes by BSSID, both in ordered maps.
//! A network created through MQTT exists before the supplicant has
//! assigned it an id; such a pending entry carries a creation sequence
//! number and queued configuration to apply once the `ADD_NETWORK` reply
//! pairs it with an id.

use std::collections::BTreeMap;

/// Supplicant network mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Ordinary client (mode 0)
    #[default]
    Station,
    /// Access point (mode 2)
    Ap,
    /// 802.11s mesh point (mode 5)
    Mesh,
}

impl Mode {
    /// From the supplicant's numeric `mode` property.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => Mode::Ap,
            5 => Mode::Mesh,
            _ => Mode::Station,
        }
    }

    /// The supplicant's numeric `mode` property.
    pub fn raw(self) -> u32 {
        match self {
            Mode::Station => 0,
            Mode::Ap => 2,
            Mode::Mesh => 5,
        }
    }

    /// The value published on `wifistate` while this mode is active.
    pub fn state_name(self) -> &'static str {
        match self {
            Mode::Station => "station",
            Mode::Ap => "AP",
            Mode::Mesh => "mesh",
        }
    }

    /// Parse a `wifistate/set` payload; case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("station") {
            Some(Mode::Station)
        } else if s.eq_ignore_ascii_case("ap") {
            Some(Mode::Ap)
        } else if s.eq_ignore_ascii_case("mesh") {
            Some(Mode::Mesh)
        } else {
            None
        }
    }
}

/// A configured supplicant network entry.
#[derive(Debug, Clone, Default)]
pub struct Network {
    /// Supplicant id; `None` while an `ADD_NETWORK` reply is outstanding
    pub id: Option<u32>,
    /// Orders concurrent pending creations; pairs the oldest pending
    /// entry with the next `ADD_NETWORK` reply
    pub create_seq: u32,
    /// SSID, also the map key
    pub ssid: String,
    /// Mode from config
    pub mode: Mode,
    /// `disabled` property
    pub disabled: bool,
    /// Configuration queued until the id is assigned
    pub pending_cfg: Vec<(String, String)>,
    /// SELECT_NETWORK requested before the id was assigned
    pub pending_select: bool,
    /// REMOVE_NETWORK requested before the id was assigned
    pub pending_remove: bool,
}

impl Network {
    /// A known entry with an assigned id.
    pub fn born(id: u32, ssid: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            ssid: ssid.into(),
            ..Self::default()
        }
    }

    /// An entry awaiting its `ADD_NETWORK` reply.
    pub fn pending(create_seq: u32, ssid: impl Into<String>) -> Self {
        Self {
            id: None,
            create_seq,
            ssid: ssid.into(),
            ..Self::default()
        }
    }
}

/// Capability flags of a scan-observed BSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BssFlags {
    /// WPA/WPA2 capable
    pub wpa: bool,
    /// WEP capable
    pub wep: bool,
    /// 802.1X/EAP
    pub eap: bool,
    /// A configured network with this SSID exists
    pub known: bool,
    /// ... and that network is disabled
    pub disabled: bool,
    /// Transient mark used only during scan reconciliation
    pub present: bool,
}

impl BssFlags {
    /// Fixed-position mask `wWekd`, `-` for absent; `present` is internal
    /// and never rendered.
    pub fn render(&self) -> String {
        let slots = [
            (self.wpa, 'w'),
            (self.wep, 'W'),
            (self.eap, 'e'),
            (self.known, 'k'),
            (self.disabled, 'd'),
        ];
        slots
            .iter()
            .map(|&(on, ch)| if on { ch } else { '-' })
            .collect()
    }

    /// Recompute the security bits from the supplicant's `flags` field.
    pub fn set_security(&mut self, flags_field: &str) {
        self.wpa = flags_field.contains("WPA");
        self.wep = flags_field.contains("WEP");
        self.eap = flags_field.contains("EAP");
    }

    /// Recompute the network-derived bits.
    pub fn set_network(&mut self, net: Option<&Network>) {
        match net {
            Some(net) => {
                self.known = true;
                self.disabled = net.disabled;
            }
            None => {
                self.known = false;
                self.disabled = false;
            }
        }
    }
}

/// One scan-observed radio cell.
#[derive(Debug, Clone, Default)]
pub struct Bss {
    /// Colon-separated 48-bit id, also the map key
    pub bssid: String,
    /// SSID, empty for hidden cells
    pub ssid: String,
    /// Frequency in MHz
    pub freq: u32,
    /// Signal level in dBm
    pub level: i32,
    /// Capability flags
    pub flags: BssFlags,
}

/// Render a MHz frequency the way the topics carry it: `2412` -> `2.412G`.
pub fn freq_ghz(freq_mhz: u32) -> String {
    format!("{:.3}G", freq_mhz as f64 * 1e-3)
}

/// Everything the dispatcher tracks about the supplicant.
#[derive(Debug, Default)]
pub struct StationState {
    /// Configured networks keyed by SSID (unique within the set)
    pub networks: BTreeMap<String, Network>,
    /// Scan-observed cells keyed by BSSID
    pub bsss: BTreeMap<String, Bss>,
    /// Creation sequence counter for pending networks
    pub create_seq: u32,
    /// Per-BSS events observed; prefer the event-driven path over full
    /// SCAN_RESULTS fetches once set
    pub have_bss_events: bool,
    /// Mode the supplicant is currently operating in
    pub curr_mode: Mode,
    /// BSSID of the current association, empty when none
    pub curr_bssid: String,
    /// Last published signal level of the current association
    pub curr_level: i32,
    /// Last published rssi (SIGNAL_POLL), 0 when cleared
    pub saved_rssi: i32,
    /// Last published link speed (SIGNAL_POLL), 0 when cleared
    pub saved_speed: i32,
    /// Associated station count in AP/mesh mode, -1 when not applicable
    pub nstations: i32,
    /// Mode filter from `wifistate/set`, `None` when unfiltered
    pub selected_mode: Option<Mode>,
    /// Wifi state as observed, before the all-disabled override
    pub real_state: &'static str,
    /// Last value published on `wifistate`; `None` until the first
    /// STATUS reply fixed the start-up state
    pub published_state: Option<String>,
    /// Id behind the last `lastAP` publish
    pub last_ap_id: Option<u32>,
    /// Id behind the last `lastmesh` publish
    pub last_mesh_id: Option<u32>,
}

impl StationState {
    /// Fresh state; `real_state` starts as `none`.
    pub fn new() -> Self {
        Self {
            real_state: "none",
            nstations: -1,
            ..Self::default()
        }
    }

    /// Linear scan for a network by supplicant id.
    pub fn network_by_id(&self, id: u32) -> Option<&Network> {
        self.networks.values().find(|n| n.id == Some(id))
    }

    /// Mutable linear scan for a network by supplicant id.
    pub fn network_by_id_mut(&mut self, id: u32) -> Option<&mut Network> {
        self.networks.values_mut().find(|n| n.id == Some(id))
    }

    /// SSID of the oldest network still awaiting its `ADD_NETWORK` reply,
    /// plus the number of pending entries.
    pub fn oldest_pending(&self) -> (Option<String>, usize) {
        let mut oldest: Option<&Network> = None;
        let mut npending = 0;
        for net in self.networks.values() {
            if net.id.is_some() {
                continue;
            }
            npending += 1;
            if oldest.map_or(true, |o| net.create_seq < o.create_seq) {
                oldest = Some(net);
            }
        }
        (oldest.map(|n| n.ssid.clone()), npending)
    }

    /// Highest-id network of `mode`, skipping `exclude` (an entry being
    /// removed). Drives the `lastAP`/`lastmesh` topics.
    pub fn last_of_mode(&self, mode: Mode, exclude: Option<&str>) -> Option<&Network> {
        self.networks
            .values()
            .filter(|n| Some(n.ssid.as_str()) != exclude)
            .filter(|n| n.mode == mode && n.id.is_some())
            .max_by_key(|n| n.id)
    }

    /// True when every network of the selected mode (or every network at
    /// all) is disabled; the published wifi state then reads `off`.
    pub fn is_mode_off(&self) -> bool {
        let mut nnet = 0;
        let mut ndis = 0;
        for net in self.networks.values() {
            if let Some(selected) = self.selected_mode {
                if net.mode != selected {
                    continue;
                }
            }
            nnet += 1;
            if net.disabled {
                ndis += 1;
            }
        }
        nnet > 0 && ndis >= nnet
    }

    /// Next creation sequence number.
    pub fn next_create_seq(&mut self) -> u32 {
        self.create_seq += 1;
        self.create_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip() {
        assert_eq!(Mode::from_raw(2), Mode::Ap);
        assert_eq!(Mode::from_raw(5), Mode::Mesh);
        assert_eq!(Mode::from_raw(0), Mode::Station);
        assert_eq!(Mode::Ap.raw(), 2);
        assert_eq!(Mode::parse("AP"), Some(Mode::Ap));
        assert_eq!(Mode::parse("ap"), Some(Mode::Ap));
        assert_eq!(Mode::parse("Mesh"), Some(Mode::Mesh));
        assert_eq!(Mode::parse("any"), None);
    }

    #[test]
    fn flag_mask_rendering() {
        let mut flags = BssFlags::default();
        flags.set_security("[WPA2-PSK-CCMP][ESS]");
        assert_eq!(flags.render(), "w----");
        flags.known = true;
        flags.disabled = true;
        assert_eq!(flags.render(), "w--kd");
        flags.set_security("[WEP][ESS]");
        assert_eq!(flags.render(), "-W-kd");
    }

    #[test]
    fn freq_rendering() {
        assert_eq!(freq_ghz(2412), "2.412G");
        assert_eq!(freq_ghz(5180), "5.180G");
    }

    #[test]
    fn oldest_pending_orders_by_create_seq() {
        let mut st = StationState::new();
        let seq = st.next_create_seq();
        st.networks
            .insert("beta".into(), Network::pending(seq, "beta"));
        let seq = st.next_create_seq();
        st.networks
            .insert("alpha".into(), Network::pending(seq, "alpha"));
        st.networks.insert("gamma".into(), Network::born(3, "gamma"));

        let (oldest, npending) = st.oldest_pending();
        assert_eq!(oldest.as_deref(), Some("beta"));
        assert_eq!(npending, 2);
    }

    #[test]
    fn last_of_mode_prefers_highest_id() {
        let mut st = StationState::new();
        let mut a = Network::born(1, "a");
        a.mode = Mode::Ap;
        let mut b = Network::born(4, "b");
        b.mode = Mode::Ap;
        let mut c = Network::born(9, "c");
        c.mode = Mode::Mesh;
        st.networks.insert("a".into(), a);
        st.networks.insert("b".into(), b);
        st.networks.insert("c".into(), c);

        assert_eq!(st.last_of_mode(Mode::Ap, None).unwrap().ssid, "b");
        assert_eq!(st.last_of_mode(Mode::Ap, Some("b")).unwrap().ssid, "a");
        assert_eq!(st.last_of_mode(Mode::Mesh, None).unwrap().ssid, "c");
    }

    #[test]
    fn mode_off_respects_selection() {
        let mut st = StationState::new();
        let mut ap = Network::born(1, "ap");
        ap.mode = Mode::Ap;
        ap.disabled = true;
        let mut sta = Network::born(2, "sta");
        sta.disabled = false;
        st.networks.insert("ap".into(), ap);
        st.networks.insert("sta".into(), sta);

        assert!(!st.is_mode_off());
        st.selected_mode = Some(Mode::Ap);
        assert!(st.is_mode_off());
        st.selected_mode = Some(Mode::Station);
        assert!(!st.is_mode_off());
    }
}
