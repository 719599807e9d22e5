//! Modem domain model: registration caches, operator table, identity,
//! vendor quirks.

/// Where a registration-derived value came from.
///
/// `nt`, `lac` and `cellid` can be carried by `+CGREG`, `+CREG` and
/// `+COPS` replies; a lower-priority source may not overwrite a value a
/// higher-priority source set, and only the owning source may clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegSource {
    /// `+COPS` (lowest)
    Cops,
    /// `+CREG`
    Creg,
    /// `+CGREG` (highest)
    Cgreg,
}

/// A derived value with the priority of the source that set it.
#[derive(Debug, Default)]
pub struct SourcedValue {
    value: String,
    source: Option<RegSource>,
}

impl SourcedValue {
    /// Current value, empty when unset.
    pub fn get(&self) -> &str {
        &self.value
    }

    /// Try to set from `source`. Rejected while a higher-priority source
    /// owns a non-empty value. Returns true when the value changed.
    pub fn set(&mut self, source: RegSource, value: &str) -> bool {
        if let Some(owner) = self.source {
            if owner > source && !self.value.is_empty() {
                return false;
            }
        }
        self.source = Some(source);
        if self.value == value {
            return false;
        }
        self.value = value.to_string();
        true
    }

    /// Clear, allowed only for the source that set the value. Returns
    /// true when a non-empty value was dropped.
    pub fn clear(&mut self, source: RegSource) -> bool {
        if self.source != Some(source) {
            return false;
        }
        self.source = None;
        if self.value.is_empty() {
            return false;
        }
        self.value.clear();
        true
    }
}

/// `+CREG`/`+CGREG` registration state text.
pub fn reg_text(stat: u32) -> &'static str {
    match stat {
        0 => "not registered",
        1 => "registered",
        2 => "searching",
        3 => "denied",
        4 => "unknown",
        5 => "roaming",
        _ => "",
    }
}

/// True when `stat` warrants an operator query.
pub fn reg_wants_operator(stat: u32) -> bool {
    matches!(stat, 1 | 3 | 5)
}

/// True when `stat` means some registration exists.
pub fn reg_is_registered(stat: u32) -> bool {
    matches!(stat, 1 | 5)
}

/// 27.007 access technology to network-technology text.
pub fn access_tech_text(act: u32) -> &'static str {
    match act {
        0 | 1 | 3 | 8 => "2g",
        2 | 4 | 5 | 6 => "3g",
        7 | 9 => "4g",
        _ => "",
    }
}

/// `*CNTI` technology name to network-technology text.
pub fn cnti_tech_text(tech: &str) -> &'static str {
    let tech = tech.to_ascii_uppercase();
    if tech.contains("LTE") {
        "4g"
    } else if tech.contains("UMTS")
        || tech.contains("HSDPA")
        || tech.contains("HSUPA")
        || tech.contains("HSPA")
        || tech.contains("WCDMA")
    {
        "3g"
    } else if tech.contains("GSM") || tech.contains("GPRS") || tech.contains("EDGE") {
        "2g"
    } else {
        ""
    }
}

/// `+CSQ` signal value in dBm; 99 is the "no value" sentinel.
pub fn rssi_dbm(raw: u32) -> Option<i32> {
    if raw == 99 {
        None
    } else {
        Some(-113 + 2 * raw as i32)
    }
}

/// `+CSQ` bit-error-rate bucket; 99 and out-of-range read as "no value".
pub fn ber_text(raw: u32) -> &'static str {
    match raw {
        0 => "<0.01%",
        1 => "0.01% -- 0.1%",
        2 => "0.1% -- 0.5%",
        3 => "0.5% -- 1%",
        4 => "1% -- 2%",
        5 => "2% -- 4%",
        6 => "4% -- 8%",
        7 => ">8%",
        _ => "",
    }
}

/// Operator id-to-name table built from `+COPN` rows.
///
/// Additive and insertion-ordered; entries never mutate once inserted,
/// the whole set clears on SIM loss. IMSI matching compares against the
/// stored id's own length (5 or 6 digits), first inserted match wins.
#[derive(Debug, Default)]
pub struct OperatorTable {
    entries: Vec<(String, String)>,
}

impl OperatorTable {
    /// Add a row; an already-known id is left untouched.
    pub fn insert(&mut self, id: &str, name: &str) {
        if self.entries.iter().any(|(known, _)| known == id) {
            return;
        }
        self.entries.push((id.to_string(), name.to_string()));
    }

    /// Name of an operator id.
    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, name)| name.as_str())
    }

    /// First inserted operator whose id prefixes `imsi`.
    pub fn match_imsi(&self, imsi: &str) -> Option<(&str, &str)> {
        self.entries
            .iter()
            .find(|(id, _)| imsi.starts_with(id.as_str()))
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }

    /// Forget everything (SIM removed).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of known operators.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no operator is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Vendor-specific behaviour switches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Quirks {
    /// SIMCOM-family modem detected
    pub simcom: bool,
    /// Operator scans only work while detached (`AT+COPS=2` first)
    pub detached_scan: bool,
    /// Ask `AT+CEER` for the reason behind a NO CARRIER
    pub ceer: bool,
}

/// One row of the quirk table, matched against brand+model.
struct QuirkRule {
    needle: &'static str,
    desc: &'static str,
    apply: fn(&mut Quirks),
}

const QUIRK_RULES: &[QuirkRule] = &[
    QuirkRule {
        needle: "SIMCOM",
        desc: "SIMCOM modem",
        apply: |q| q.simcom = true,
    },
    QuirkRule {
        needle: "SIMCOM",
        desc: "operator scan only while detached",
        apply: |q| q.detached_scan = true,
    },
];

/// Everything the dispatcher tracks about the modem.
#[derive(Debug, Default)]
pub struct ModemState {
    /// Operator table from `+COPN`
    pub operators: OperatorTable,
    /// IMSI as read via `AT+CIMI`
    pub imsi: String,
    /// Manufacturer (`AT+CGMI`)
    pub brand: String,
    /// Model (`AT+CGMM`)
    pub model: String,
    /// Firmware revision (`AT+CGMR`)
    pub revision: String,
    /// IMEI (`AT+CGSN`)
    pub imei: String,
    /// Network technology, prioritised by source
    pub nt: SourcedValue,
    /// Location area code, prioritised by source
    pub lac: SourcedValue,
    /// Cell id, prioritised by source
    pub cellid: SourcedValue,
    /// Quirks forced from the command line
    pub forced: Quirks,
    /// Effective quirks: forced plus detected
    pub quirks: Quirks,
    /// SIM identification finished (`PB DONE`/`SMS DONE` seen)
    pub sim_ready: bool,
}

impl ModemState {
    /// Fresh state with command-line-forced quirks.
    pub fn new(forced: Quirks) -> Self {
        Self {
            forced,
            quirks: forced,
            ..Self::default()
        }
    }

    /// Re-run the quirk table after a brand or model change; returns the
    /// descriptions of newly enabled quirks.
    pub fn reeval_quirks(&mut self) -> Vec<&'static str> {
        let haystack = format!("{} {}", self.brand, self.model).to_ascii_uppercase();
        let before = self.quirks;
        let mut quirks = self.forced;
        let mut newly = Vec::new();
        for rule in QUIRK_RULES {
            if haystack.contains(rule.needle) {
                (rule.apply)(&mut quirks);
            }
        }
        if quirks != before {
            for rule in QUIRK_RULES {
                if haystack.contains(rule.needle) {
                    newly.push(rule.desc);
                }
            }
        }
        self.quirks = quirks;
        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_formula_and_sentinel() {
        assert_eq!(rssi_dbm(17), Some(-79));
        assert_eq!(rssi_dbm(0), Some(-113));
        assert_eq!(rssi_dbm(31), Some(-51));
        assert_eq!(rssi_dbm(99), None);
    }

    #[test]
    fn ber_buckets() {
        assert_eq!(ber_text(2), "0.1% -- 0.5%");
        assert_eq!(ber_text(0), "<0.01%");
        assert_eq!(ber_text(6), "4% -- 8%");
        assert_eq!(ber_text(99), "");
    }

    #[test]
    fn access_tech_mapping() {
        assert_eq!(access_tech_text(0), "2g");
        assert_eq!(access_tech_text(2), "3g");
        assert_eq!(access_tech_text(7), "4g");
        assert_eq!(access_tech_text(13), "");
    }

    #[test]
    fn source_priority_blocks_lower_sources() {
        let mut nt = SourcedValue::default();
        assert!(nt.set(RegSource::Cgreg, "4g"));
        assert!(!nt.set(RegSource::Creg, "3g"));
        assert_eq!(nt.get(), "4g");
        // equal or higher priority may take over
        assert!(!nt.set(RegSource::Cgreg, "4g"));
        assert_eq!(nt.get(), "4g");
    }

    #[test]
    fn only_the_owner_clears() {
        let mut lac = SourcedValue::default();
        lac.set(RegSource::Creg, "31");
        assert!(!lac.clear(RegSource::Cops));
        assert_eq!(lac.get(), "31");
        assert!(lac.clear(RegSource::Creg));
        assert_eq!(lac.get(), "");
        // once cleared, any source may set again
        assert!(lac.set(RegSource::Cops, "99"));
    }

    #[test]
    fn imsi_match_uses_stored_length_and_insertion_order() {
        let mut ops = OperatorTable::default();
        ops.insert("20601", "First");
        ops.insert("206015", "Longer");
        ops.insert("20699", "Other");
        // 5-digit id wins because it was inserted first
        assert_eq!(
            ops.match_imsi("206015123456789"),
            Some(("20601", "First"))
        );
        assert_eq!(ops.match_imsi("20699123456789"), Some(("20699", "Other")));
        assert_eq!(ops.match_imsi("31026"), None);
    }

    #[test]
    fn operator_table_is_additive() {
        let mut ops = OperatorTable::default();
        ops.insert("20601", "One");
        ops.insert("20601", "Two");
        assert_eq!(ops.name_of("20601"), Some("One"));
        assert_eq!(ops.len(), 1);
        ops.clear();
        assert!(ops.is_empty());
    }

    #[test]
    fn simcom_enables_detached_scan() {
        let mut modem = ModemState::new(Quirks::default());
        modem.brand = "SIMCOM_Ltd".into();
        modem.model = "SIMCOM_SIM7600E".into();
        let newly = modem.reeval_quirks();
        assert!(modem.quirks.simcom);
        assert!(modem.quirks.detached_scan);
        assert!(!modem.quirks.ceer);
        assert_eq!(newly.len(), 2);
        // second evaluation reports nothing new
        assert!(modem.reeval_quirks().is_empty());
    }

    #[test]
    fn forced_quirks_survive_reevaluation() {
        let forced = Quirks {
            ceer: true,
            ..Quirks::default()
        };
        let mut modem = ModemState::new(forced);
        modem.brand = "Quectel".into();
        modem.reeval_quirks();
        assert!(modem.quirks.ceer);
        assert!(!modem.quirks.simcom);
    }
}
