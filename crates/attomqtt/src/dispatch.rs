//! Record classification and handlers for the AT dialect.
//!
//! A record either terminates the in-flight command (`OK`, `ERROR`,
//! `ABORT`, `NO CARRIER`, `+CME ERROR ...`), is an unsolicited result
//! code (leading `+`/`*`, plus a few literal vendor strings), or belongs
//! to the in-flight command's body. Status reports like `+CSQ:` are
//! processed the same way whether they arrive solicited or interleaved;
//! the terminator alone advances the queue.

use tracing::{debug, info, warn};

use tomqtt_core::publish::MqttSink;

use crate::bridge::{AtBridge, AtTimer};
use crate::modem::{
    access_tech_text, ber_text, cnti_tech_text, reg_is_registered, reg_text, reg_wants_operator,
    rssi_dbm, RegSource,
};

/// Terminating status tokens of a multi-line response.
fn is_terminator(record: &str) -> bool {
    record == "OK"
        || record == "ERROR"
        || record == "ABORT"
        || record == "NO CARRIER"
        || record.starts_with("+CME ERROR")
}

/// Literal unsolicited records without the `+`/`*` sigil.
fn is_literal_urc(record: &str) -> bool {
    record == "RING" || record == "PB DONE" || record == "SMS DONE"
}

fn strip_quotes(field: &str) -> &str {
    field
        .trim()
        .trim_start_matches('"')
        .trim_end_matches('"')
}

/// Split a `+CREG`-style argument list, skipping the leading `<n>` field
/// of a solicited reply so the status field always comes first.
fn reg_fields(rest: &str) -> Vec<&str> {
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    let unquoted_number =
        |f: &str| !f.is_empty() && !f.starts_with('"') && f.chars().all(|c| c.is_ascii_digit());
    if fields.len() >= 2 && unquoted_number(fields[0]) && unquoted_number(fields[1]) {
        fields[1..].to_vec()
    } else {
        fields
    }
}

impl<S: MqttSink> AtBridge<S> {
    /// Process one chunk of tty bytes.
    pub async fn handle_chunk(&mut self, data: &[u8]) -> tomqtt_core::Result<()> {
        let records = self.linebuf.push(data)?;
        for record in records {
            self.handle_record(record).await;
        }
        Ok(())
    }

    async fn handle_record(&mut self, record: String) {
        if is_terminator(&record) {
            if self.queue.is_empty() {
                // a terminator with nothing queued is unsolicited
                if record == "NO CARRIER" {
                    self.on_no_carrier().await;
                } else {
                    self.publish_raw(&record);
                }
                return;
            }
            self.on_terminator(record).await;
            return;
        }

        if is_literal_urc(&record) {
            self.handle_urc(&record).await;
            return;
        }

        if (record.starts_with('+') || record.starts_with('*'))
            && !record.starts_with("+CME ERROR")
        {
            self.handle_urc(&record).await;
            if !self.queue.is_empty() {
                // keep it for the raw response reconstruction
                self.body.push(record);
            }
            return;
        }

        if self.queue.is_empty() {
            // stray line, probably someone typing on the tty
            debug!(record, "record without a command in flight");
            self.publish_raw(&record);
        } else {
            self.body.push(record);
        }
    }

    /// A terminator arrived: correlate with the head command.
    async fn on_terminator(&mut self, term: String) {
        let Some(head) = self.queue.complete_head() else {
            return;
        };
        self.timers.remove(&AtTimer::CmdTimeout);
        let body = self.body.take();

        // reconstruct the full response for the raw passthrough
        let mut raw = body.join("\n");
        if !raw.is_empty() {
            raw.push('\n');
        }
        raw.push_str(&term);
        self.publish_raw(&raw);

        if term == "OK" {
            self.on_response_ok(&head.line, &body).await;
        } else {
            warn!(cmd = %head.line, term, "command failed");
            self.publish_fail(&format!("{}: {}", head.line, term));
        }

        self.write_head().await;
    }

    /// Handle the body of a successfully completed command, keyed by the
    /// command's prefix. Status reports inside the body were already
    /// processed on arrival; this covers the bare-text replies.
    async fn on_response_ok(&mut self, cmd: &str, body: &[String]) {
        let cmd_uc = cmd.trim().to_ascii_uppercase();
        // the command echo is part of the body with ATE1 active
        let lines: Vec<&str> = body
            .iter()
            .map(String::as_str)
            .filter(|l| !l.eq_ignore_ascii_case(cmd.trim()))
            .collect();
        let first_bare = lines
            .iter()
            .find(|l| !l.starts_with('+') && !l.starts_with('*'))
            .copied();

        match cmd_uc.as_str() {
            "AT+CIMI" => {
                if let Some(imsi) = first_bare {
                    let imsi: String = imsi.trim().to_string();
                    if !imsi.is_empty() && imsi.chars().all(|c| c.is_ascii_digit()) {
                        self.set_imsi(&imsi);
                    }
                }
            }
            "AT+CCID" | "AT+CCID?" => {
                if let Some(iccid) = first_bare {
                    let iccid = iccid.trim().trim_start_matches("ICCID:").trim().to_string();
                    if !iccid.is_empty() {
                        self.publish_state("iccid", &iccid);
                    }
                }
            }
            "AT+CGMI" => {
                if let Some(brand) = first_bare {
                    let brand = brand.trim().to_string();
                    self.set_brand(&brand);
                }
            }
            "AT+CGMM" => {
                if let Some(model) = first_bare {
                    let model = model.trim().to_string();
                    self.set_model(&model);
                }
            }
            "AT+CGMR" => {
                if let Some(rev) = first_bare {
                    let rev = rev.trim().to_string();
                    self.modem.revision = rev.clone();
                    self.publish_state("rev", &rev);
                }
            }
            "AT+CGSN" => {
                if let Some(imei) = first_bare {
                    let imei = imei.trim().to_string();
                    if imei.chars().all(|c| c.is_ascii_digit()) && !imei.is_empty() {
                        self.modem.imei = imei.clone();
                        self.publish_state("imei", &imei);
                    }
                }
            }
            "AT+COPN" => {
                // table complete, the IMSI match may resolve now
                self.republish_sim_operator();
            }
            _ => {}
        }
    }

    /// Dispatch an unsolicited record or status report.
    pub(crate) async fn handle_urc(&mut self, record: &str) {
        if record == "RING" {
            self.publish_raw("RING");
            return;
        }
        if record == "PB DONE" || record == "SMS DONE" {
            // vendor quirk: SIM setup finished
            debug!(record, "sim setup complete");
            self.modem.sim_ready = true;
            return;
        }

        let Some((tag, rest)) = record.split_once(':') else {
            self.publish_raw(record);
            return;
        };
        let rest = rest.trim();

        match tag {
            "+CSQ" => self.on_csq(rest),
            "+CREG" => self.on_reg(rest, RegSource::Creg).await,
            "+CGREG" => self.on_reg(rest, RegSource::Cgreg).await,
            "+COPS" => self.on_cops(rest),
            "+COPN" => self.on_copn(rest),
            "+CPIN" => self.on_cpin(rest).await,
            "+SIMCARD" => {
                if rest.eq_ignore_ascii_case("NOT AVAILABLE") {
                    self.on_sim_lost();
                } else {
                    self.publish_raw(record);
                }
            }
            "+CSPN" => {
                if let Some(name) = rest.split(',').next() {
                    let name = strip_quotes(name).to_string();
                    self.publish_state("simop", &name);
                }
            }
            "+CNUM" => {
                let fields: Vec<&str> = rest.split(',').collect();
                if let Some(number) = fields.get(1) {
                    let number = strip_quotes(number).to_string();
                    if !number.is_empty() {
                        self.publish_state("number", &number);
                    }
                }
            }
            "+CGMI" => {
                let brand = rest.to_string();
                self.set_brand(&brand);
            }
            "+CGMM" => {
                let model = rest.to_string();
                self.set_model(&model);
            }
            "+CGMR" => {
                let rev = rest.to_string();
                self.modem.revision = rev.clone();
                self.publish_state("rev", &rev);
            }
            "+CGSN" => {
                let imei = rest.to_string();
                self.modem.imei = imei.clone();
                self.publish_state("imei", &imei);
            }
            "+CCID" | "+ICCID" => {
                let iccid = strip_quotes(rest).to_string();
                self.publish_state("iccid", &iccid);
            }
            "+CEER" => {
                let reason = rest.to_string();
                self.publish_warn(&reason);
            }
            "*CNTI" => {
                // *CNTI: 0,<tech>
                if let Some(tech) = rest.split(',').nth(1) {
                    let nt = cnti_tech_text(tech);
                    if !nt.is_empty() && self.modem.nt.set(RegSource::Cops, nt) {
                        let value = self.modem.nt.get().to_string();
                        self.publish_state("nt", &value);
                    }
                }
            }
            _ => {
                // unknown result code, forward verbatim, never fatal
                self.publish_raw(record);
            }
        }
    }

    fn on_csq(&mut self, rest: &str) {
        let mut fields = rest.split(',').map(str::trim);
        let Some(rssi_raw) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
            return;
        };
        let ber_raw = fields.next().and_then(|f| f.parse::<u32>().ok()).unwrap_or(99);

        let rssi = rssi_dbm(rssi_raw)
            .map(|v| v.to_string())
            .unwrap_or_default();
        self.publish_state("rssi", &rssi);
        self.publish_state("ber", ber_text(ber_raw));
    }

    async fn on_reg(&mut self, rest: &str, source: RegSource) {
        let fields = reg_fields(rest);
        let Some(stat) = fields
            .first()
            .and_then(|f| strip_quotes(f).parse::<u32>().ok())
        else {
            return;
        };

        let topic = match source {
            RegSource::Cgreg => "greg",
            _ => "reg",
        };
        self.publish_state(topic, reg_text(stat));

        let lac = fields
            .get(1)
            .and_then(|f| u32::from_str_radix(strip_quotes(f), 16).ok());
        let cellid = fields
            .get(2)
            .and_then(|f| u32::from_str_radix(strip_quotes(f), 16).ok());
        let act = fields
            .get(3)
            .and_then(|f| strip_quotes(f).parse::<u32>().ok());

        if reg_is_registered(stat) {
            if let Some(lac) = lac {
                if self.modem.lac.set(source, &lac.to_string()) {
                    let value = self.modem.lac.get().to_string();
                    self.publish_state("lac", &value);
                }
            }
            if let Some(cellid) = cellid {
                if self.modem.cellid.set(source, &cellid.to_string()) {
                    let value = self.modem.cellid.get().to_string();
                    self.publish_state("cellid", &value);
                }
            }
            if let Some(act) = act {
                let nt = access_tech_text(act);
                if !nt.is_empty() && self.modem.nt.set(source, nt) {
                    let value = self.modem.nt.get().to_string();
                    self.publish_state("nt", &value);
                }
            }
        } else {
            if self.modem.lac.clear(source) {
                self.publish_state("lac", "");
            }
            if self.modem.cellid.clear(source) {
                self.publish_state("cellid", "");
            }
            if self.modem.nt.clear(source) {
                self.publish_state("nt", "");
            }
        }

        if reg_wants_operator(stat) {
            self.send_unique("AT+COPS?".into()).await;
        }
    }

    fn on_cops(&mut self, rest: &str) {
        if rest.trim_start().starts_with('(') {
            // parenthesised form: operator scan result
            let mut rows = Vec::new();
            for group in rest.split("),") {
                let group = group
                    .trim()
                    .trim_start_matches('(')
                    .trim_end_matches(')');
                if group.is_empty() || !group.contains(',') {
                    continue;
                }
                let fields: Vec<&str> = group.split(',').map(str::trim).collect();
                if !fields.get(1).is_some_and(|f| f.starts_with('"')) {
                    // trailing format lists, not an operator row
                    continue;
                }
                let stat = fields.first().copied().unwrap_or("");
                let name = fields.get(1).map(|f| strip_quotes(f)).unwrap_or("");
                let id = fields.get(3).map(|f| strip_quotes(f)).unwrap_or("");
                if name.is_empty() && id.is_empty() {
                    continue;
                }
                rows.push(format!("{stat},{name},{id}"));
            }
            let topic = self.topic("ops");
            self.sink.publish(&topic, &rows.join("\n"), false);
            return;
        }

        // plain form: current operator
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            // detached, no operator to report
            self.publish_state("op", "");
            self.publish_state("opid", "");
            return;
        }
        let format = fields[1];
        let oper = strip_quotes(fields[2]).to_string();
        match format {
            "2" => {
                self.publish_state("opid", &oper);
                if let Some(name) = self.modem.operators.name_of(&oper) {
                    let name = name.to_string();
                    self.publish_state("op", &name);
                }
            }
            _ => self.publish_state("op", &oper),
        }
        if let Some(act) = fields.get(3).and_then(|f| f.parse::<u32>().ok()) {
            let nt = access_tech_text(act);
            if !nt.is_empty() && self.modem.nt.set(RegSource::Cops, nt) {
                let value = self.modem.nt.get().to_string();
                self.publish_state("nt", &value);
            }
        }
    }

    fn on_copn(&mut self, rest: &str) {
        let mut fields = rest.split(',');
        let (Some(id), Some(name)) = (fields.next(), fields.next()) else {
            return;
        };
        let id = strip_quotes(id);
        let name = strip_quotes(name);
        if (5..=6).contains(&id.len()) {
            self.modem.operators.insert(id, name);
        }
    }

    async fn on_cpin(&mut self, rest: &str) {
        if rest.eq_ignore_ascii_case("READY") {
            // SIM is up: read its identity
            for cmd in ["AT+CSPN?", "AT+CCID", "AT+CIMI", "AT+CNUM", "AT+COPN"] {
                self.send_unique(cmd.into()).await;
            }
        } else {
            self.publish_warn(&format!("sim: {rest}"));
        }
    }

    /// `+SIMCARD: NOT AVAILABLE` - drop everything SIM-derived.
    fn on_sim_lost(&mut self) {
        info!("sim lost, clearing sim-derived state");
        for suffix in ["imsi", "iccid", "number", "simop", "simopid", "op", "opid"] {
            self.publish_state(suffix, "");
        }
        self.modem.operators.clear();
        self.modem.imsi.clear();
        self.modem.sim_ready = false;
    }

    async fn on_no_carrier(&mut self) {
        self.publish_raw("NO CARRIER");
        if self.modem.quirks.ceer {
            self.send_unique("AT+CEER".into()).await;
        }
    }

    fn set_imsi(&mut self, imsi: &str) {
        self.modem.imsi = imsi.to_string();
        let imsi = imsi.to_string();
        self.publish_state("imsi", &imsi);
        self.republish_sim_operator();
    }

    /// Publish the SIM's home operator from the IMSI prefix match.
    fn republish_sim_operator(&mut self) {
        if self.modem.imsi.is_empty() {
            return;
        }
        let matched = self
            .modem
            .operators
            .match_imsi(&self.modem.imsi)
            .map(|(id, name)| (id.to_string(), name.to_string()));
        if let Some((id, name)) = matched {
            self.publish_state("simopid", &id);
            // +CSPN is authoritative for the name when the SIM carries one
            let simop_topic = self.topic("simop");
            if self.cache.cached(&simop_topic).unwrap_or("").is_empty() {
                self.publish_state("simop", &name);
            }
        }
    }

    fn set_brand(&mut self, brand: &str) {
        self.modem.brand = brand.to_string();
        let brand = brand.to_string();
        self.publish_state("brand", &brand);
        self.quirks_changed();
    }

    fn set_model(&mut self, model: &str) {
        self.modem.model = model.to_string();
        let model = model.to_string();
        self.publish_state("model", &model);
        self.quirks_changed();
    }

    fn quirks_changed(&mut self) {
        for desc in self.modem.reeval_quirks() {
            info!(desc, "vendor quirk enabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_set() {
        assert!(is_terminator("OK"));
        assert!(is_terminator("ERROR"));
        assert!(is_terminator("ABORT"));
        assert!(is_terminator("NO CARRIER"));
        assert!(is_terminator("+CME ERROR: SIM not inserted"));
        assert!(!is_terminator("+CSQ: 17,2"));
        assert!(!is_terminator("RING"));
    }

    #[test]
    fn literal_urcs() {
        assert!(is_literal_urc("RING"));
        assert!(is_literal_urc("PB DONE"));
        assert!(is_literal_urc("SMS DONE"));
        assert!(!is_literal_urc("OK"));
    }

    #[test]
    fn reg_fields_skips_the_mode_of_solicited_replies() {
        // unsolicited: stat first
        assert_eq!(reg_fields("1,\"001F\",\"ABCD1234\""), vec!["1", "\"001F\"", "\"ABCD1234\""]);
        // solicited: leading <n> is dropped
        assert_eq!(
            reg_fields("0,1,\"001F\",\"ABCD1234\",7"),
            vec!["1", "\"001F\"", "\"ABCD1234\"", "7"]
        );
        assert_eq!(reg_fields("2"), vec!["2"]);
        assert_eq!(reg_fields("0,5"), vec!["5"]);
    }

    #[test]
    fn quotes_strip() {
        assert_eq!(strip_quotes("\"001F\""), "001F");
        assert_eq!(strip_quotes(" 7 "), "7");
    }
}
