//! End-to-end scenarios for the AT bridge, driven through a mock tty and
//! a recording MQTT sink.

use attomqtt::bridge::{AtBridge, AtOptions, AtTimer};
use tomqtt_core::test_util::{MockTransport, RecordingSink, WrittenLines};

fn bridge() -> (AtBridge<RecordingSink>, WrittenLines) {
    let transport = MockTransport::new();
    let written = transport.written();
    let bridge = AtBridge::new(
        "net/tty0/",
        AtOptions::default(),
        RecordingSink::new(),
        Box::new(transport),
    );
    (bridge, written)
}

fn sent(written: &WrittenLines) -> Vec<String> {
    written.lock().unwrap().clone()
}

#[tokio::test]
async fn signal_poll_publishes_rssi_and_ber() {
    let (mut bridge, written) = bridge();

    bridge.handle_mqtt("net/tty0/at/set", "AT+CSQ").await;
    assert_eq!(sent(&written), vec!["AT+CSQ"]);

    bridge
        .handle_chunk(b"+CSQ: 17,2\r\n\r\nOK\r\n")
        .await
        .unwrap();

    assert_eq!(bridge.sink.last("net/tty0/rssi"), Some("-79"));
    assert_eq!(bridge.sink.last("net/tty0/ber"), Some("0.1% -- 0.5%"));
    assert_eq!(bridge.sink.last_retain("net/tty0/rssi"), Some(true));
    assert!(bridge.queue().is_empty());
    // the reconstructed response went out raw, non-retained
    assert_eq!(bridge.sink.last("net/tty0/raw/at"), Some("+CSQ: 17,2\nOK"));
    assert_eq!(bridge.sink.last_retain("net/tty0/raw/at"), Some(false));
}

#[tokio::test]
async fn csq_99_is_the_no_value_sentinel() {
    let (mut bridge, _written) = bridge();

    bridge.handle_chunk(b"+CSQ: 17,2\r\n").await.unwrap();
    assert_eq!(bridge.sink.last("net/tty0/rssi"), Some("-79"));

    bridge.handle_chunk(b"+CSQ: 99,99\r\n").await.unwrap();
    assert_eq!(bridge.sink.last("net/tty0/rssi"), Some(""));
    assert_eq!(bridge.sink.last("net/tty0/ber"), Some(""));
}

#[tokio::test]
async fn creg_decodes_location_and_technology() {
    let (mut bridge, written) = bridge();

    bridge
        .handle_chunk(b"+CREG: 0,1,\"001F\",\"ABCD1234\",7\r\n")
        .await
        .unwrap();

    assert_eq!(bridge.sink.last("net/tty0/reg"), Some("registered"));
    assert_eq!(bridge.sink.last("net/tty0/lac"), Some("31"));
    assert_eq!(bridge.sink.last("net/tty0/cellid"), Some("2882400308"));
    assert_eq!(bridge.sink.last("net/tty0/nt"), Some("4g"));
    // registered state asks for the operator
    assert_eq!(sent(&written), vec!["AT+COPS?"]);
}

#[tokio::test]
async fn cgreg_updates_the_gprs_cache_not_the_general_one() {
    let (mut bridge, _written) = bridge();

    bridge.handle_chunk(b"+CGREG: 1,\"0010\",\"000000FF\",7\r\n").await.unwrap();

    assert_eq!(bridge.sink.last("net/tty0/greg"), Some("registered"));
    assert_eq!(bridge.sink.count("net/tty0/reg"), 0);
}

#[tokio::test]
async fn higher_priority_registration_source_wins() {
    let (mut bridge, _written) = bridge();

    bridge
        .handle_chunk(b"+CGREG: 1,\"0010\",\"000000FF\",7\r\n")
        .await
        .unwrap();
    assert_eq!(bridge.sink.last("net/tty0/nt"), Some("4g"));
    assert_eq!(bridge.sink.last("net/tty0/lac"), Some("16"));

    // CREG carries older technology; CGREG owns the value
    bridge
        .handle_chunk(b"+CREG: 1,\"0020\",\"000000AA\",2\r\n")
        .await
        .unwrap();
    assert_eq!(bridge.sink.last("net/tty0/nt"), Some("4g"));
    assert_eq!(bridge.sink.last("net/tty0/lac"), Some("16"));

    // only the owning source may clear
    bridge.handle_chunk(b"+CREG: 0\r\n").await.unwrap();
    assert_eq!(bridge.sink.last("net/tty0/nt"), Some("4g"));
    bridge.handle_chunk(b"+CGREG: 0\r\n").await.unwrap();
    assert_eq!(bridge.sink.last("net/tty0/nt"), Some(""));
    assert_eq!(bridge.sink.last("net/tty0/lac"), Some(""));
}

#[tokio::test]
async fn sim_ready_batch_and_imsi_operator_match() {
    let (mut bridge, written) = bridge();

    bridge.handle_chunk(b"+CPIN: READY\r\n").await.unwrap();
    assert_eq!(sent(&written), vec!["AT+CSPN?"]);
    assert_eq!(bridge.queue().len(), 5);

    // operator table rows arrive as the +COPN listing streams in
    bridge
        .handle_chunk(b"+COPN: \"20601\",\"Proximus\"\r\n+COPN: \"20610\",\"Orange Belgium\"\r\n")
        .await
        .unwrap();

    // drain the batch up to AT+CIMI
    bridge.handle_chunk(b"+CSPN: \"PROXIMUS\",1\r\nOK\r\n").await.unwrap(); // AT+CSPN?
    bridge.handle_chunk(b"89320160000000000000\r\nOK\r\n").await.unwrap(); // AT+CCID
    bridge
        .handle_chunk(b"AT+CIMI\r\n206011234567890\r\nOK\r\n")
        .await
        .unwrap(); // AT+CIMI, echo included

    assert_eq!(bridge.sink.last("net/tty0/imsi"), Some("206011234567890"));
    assert_eq!(bridge.sink.last("net/tty0/iccid"), Some("89320160000000000000"));
    assert_eq!(bridge.sink.last("net/tty0/simopid"), Some("20601"));
    // +CSPN named the SIM operator, the table match must not override it
    assert_eq!(bridge.sink.last("net/tty0/simop"), Some("PROXIMUS"));
}

#[tokio::test]
async fn sim_loss_clears_sim_derived_state() {
    let (mut bridge, _written) = bridge();

    bridge.handle_chunk(b"+COPN: \"20601\",\"Proximus\"\r\n").await.unwrap();
    bridge.handle_chunk(b"+CSPN: \"PROXIMUS\",1\r\n").await.unwrap();
    bridge.handle_chunk(b"+SIMCARD: NOT AVAILABLE\r\n").await.unwrap();

    assert_eq!(bridge.sink.last("net/tty0/simop"), Some(""));
    assert!(bridge.modem().operators.is_empty());
}

#[tokio::test]
async fn simcom_brand_enables_detached_operator_scan() {
    let (mut bridge, written) = bridge();

    bridge.handle_mqtt("net/tty0/at/set", "AT+CGMI").await;
    bridge
        .handle_chunk(b"AT+CGMI\r\nSIMCOM_Ltd\r\n\r\nOK\r\n")
        .await
        .unwrap();
    assert_eq!(bridge.sink.last("net/tty0/brand"), Some("SIMCOM_Ltd"));
    assert!(bridge.modem().quirks.detached_scan);

    bridge.handle_mqtt("net/tty0/ops/scan", "").await;
    bridge.handle_chunk(b"OK\r\n").await.unwrap(); // AT+COPS=2 done
    let cmds = sent(&written);
    assert_eq!(cmds[1..], ["AT+COPS=2".to_string(), "AT+COPS=?".to_string()]);
}

#[tokio::test]
async fn operator_scan_rows_are_published_on_ops() {
    let (mut bridge, _written) = bridge();

    bridge
        .handle_chunk(
            b"+COPS: (2,\"Proximus\",\"PROX\",\"20601\",7),(1,\"Orange Belgium\",\"ORANGE\",\"20610\",2),,(0,1,2,3,4),(0,1,2)\r\n",
        )
        .await
        .unwrap();

    assert_eq!(
        bridge.sink.last("net/tty0/ops"),
        Some("2,Proximus,20601\n1,Orange Belgium,20610")
    );
    assert_eq!(bridge.sink.last_retain("net/tty0/ops"), Some(false));
}

#[tokio::test]
async fn current_operator_reaches_op_and_opid() {
    let (mut bridge, _written) = bridge();

    bridge.handle_chunk(b"+COPN: \"20601\",\"Proximus\"\r\n").await.unwrap();
    bridge.handle_chunk(b"+COPS: 0,2,\"20601\",7\r\n").await.unwrap();
    assert_eq!(bridge.sink.last("net/tty0/opid"), Some("20601"));
    assert_eq!(bridge.sink.last("net/tty0/op"), Some("Proximus"));

    bridge.handle_chunk(b"+COPS: 0,0,\"Proximus\",7\r\n").await.unwrap();
    assert_eq!(bridge.sink.last("net/tty0/op"), Some("Proximus"));
}

#[tokio::test]
async fn urc_never_advances_the_queue() {
    let (mut bridge, written) = bridge();

    bridge.handle_mqtt("net/tty0/raw/send", "AT+CGSN").await;
    assert_eq!(sent(&written), vec!["AT+CGSN"]);

    bridge.handle_chunk(b"+CREG: 2\r\nRING\r\n").await.unwrap();
    assert_eq!(bridge.queue().head().unwrap().line, "AT+CGSN");

    bridge
        .handle_chunk(b"AT+CGSN\r\n490154203237518\r\nOK\r\n")
        .await
        .unwrap();
    assert_eq!(bridge.sink.last("net/tty0/imei"), Some("490154203237518"));
    assert!(bridge.queue().is_empty());
}

#[tokio::test]
async fn unknown_urc_forwards_raw_and_is_not_fatal() {
    let (mut bridge, _written) = bridge();

    bridge.handle_chunk(b"+XCELLINFO: 1,2,3\r\n").await.unwrap();
    assert_eq!(
        bridge.sink.last("net/tty0/raw/at"),
        Some("+XCELLINFO: 1,2,3")
    );
    assert_eq!(bridge.sink.last_retain("net/tty0/raw/at"), Some(false));
    assert!(bridge.lost_reason().is_none());
}

#[tokio::test]
async fn non_ok_terminator_publishes_fail() {
    let (mut bridge, _written) = bridge();

    bridge.handle_mqtt("net/tty0/at/set", "AT+CPIN?").await;
    bridge
        .handle_chunk(b"+CME ERROR: SIM not inserted\r\n")
        .await
        .unwrap();

    assert_eq!(
        bridge.sink.last("net/tty0/fail"),
        Some("AT+CPIN?: +CME ERROR: SIM not inserted")
    );
    assert!(bridge.queue().is_empty());
}

#[tokio::test]
async fn five_consecutive_timeouts_lose_the_transport() {
    let (mut bridge, _written) = bridge();

    for _ in 0..5 {
        bridge.handle_mqtt("net/tty0/at/set", "AT+CSQ").await;
        bridge.handle_timer(AtTimer::CmdTimeout).await;
    }

    let reason = bridge.lost_reason().expect("transport must be lost");
    assert!(reason.contains("5 commands got timeout"));
}

#[tokio::test]
async fn clear_retained_blanks_every_published_topic() {
    let (mut bridge, _written) = bridge();

    bridge.handle_chunk(b"+CSQ: 17,2\r\n").await.unwrap();
    bridge
        .handle_chunk(b"+CREG: 0,1,\"001F\",\"ABCD1234\",7\r\n")
        .await
        .unwrap();
    bridge.sink.clear();

    bridge.clear_retained();

    for topic in ["rssi", "ber", "reg", "lac", "cellid", "nt"] {
        assert_eq!(
            bridge.sink.last(&format!("net/tty0/{topic}")),
            Some(""),
            "retained topic {topic} must be cleared"
        );
    }
    assert!(bridge
        .sink
        .messages
        .iter()
        .all(|m| m.retain && m.payload.is_empty()));
}

#[tokio::test]
async fn startup_enables_echo_and_reads_identity() {
    let (mut bridge, written) = bridge();

    bridge.start().await;
    assert_eq!(sent(&written), vec!["ATE1"]);
    assert_eq!(bridge.queue().len(), 6);
    assert!(bridge.queue().contains("AT+CPIN?"));
}
