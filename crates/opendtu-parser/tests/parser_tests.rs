use opendtu_parser::{parse_limit_status, parse_live_status, ParseError};
use serde_json::{json, Value};
use types::LimitStatus;

const SERIAL: &str = "114182912345";

fn fixture(data: &str) -> Value {
    serde_json::from_str(data).expect("fixture json")
}

#[test]
fn parse_live_status_normalizes_units() {
    let data = fixture(include_str!("fixtures/livedata.json"));
    let parsed = parse_live_status(SERIAL, &data).expect("parse");

    assert_eq!(parsed.serial, SERIAL);
    assert_eq!(parsed.total_power_w, 713);
    assert_eq!(parsed.power_w, Some(312));
    assert_eq!(parsed.reactive_power_var, Some(13));
    assert_eq!(parsed.voltage_mv, Some(231_700));
    assert_eq!(parsed.current_ma, Some(1_350));
    assert_eq!(parsed.frequency_mhz, Some(50_020));
    assert_eq!(parsed.limit_absolute_w, Some(400));
    assert_eq!(parsed.limit_relative_pct, Some(50));
    assert_eq!(parsed.derived_max_power_w(), Some(800));
}

#[test]
fn missing_reactive_power_keeps_other_fields() {
    let data = fixture(include_str!("fixtures/livedata_no_reactive.json"));
    let parsed = parse_live_status(SERIAL, &data).expect("parse");

    assert_eq!(parsed.reactive_power_var, None);
    assert_eq!(parsed.power_w, Some(640));
    assert_eq!(parsed.voltage_mv, Some(229_900));
    assert_eq!(parsed.current_ma, Some(2_780));
    assert_eq!(parsed.frequency_mhz, Some(49_980));
}

#[test]
fn missing_total_power_fails() {
    let data = json!({
        "inverters": [{ "serial": SERIAL, "AC": { "0": { "Power": { "v": 10.0 } } } }],
        "total": {}
    });
    let err = parse_live_status(SERIAL, &data).expect_err("missing total");
    assert!(matches!(err, ParseError::MissingField("total.Power.v")));
}

#[test]
fn missing_serial_fails() {
    let data = json!({ "inverters": [], "total": { "Power": { "v": 1.0 } } });
    let err = parse_live_status(SERIAL, &data).expect_err("no inverters");
    assert!(matches!(err, ParseError::MissingField(_)));

    let data = json!({ "inverters": [{ "name": "x" }], "total": { "Power": { "v": 1.0 } } });
    let err = parse_live_status(SERIAL, &data).expect_err("no serial");
    assert!(matches!(err, ParseError::MissingField(_)));
}

#[test]
fn other_inverter_payload_is_mismatch() {
    let data = json!({
        "inverters": [{ "serial": "999" }],
        "total": { "Power": { "v": 1.0 } }
    });
    match parse_live_status(SERIAL, &data) {
        Err(ParseError::SerialMismatch { expected, found }) => {
            assert_eq!(expected, SERIAL);
            assert_eq!(found, "999");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn non_numeric_optional_reading_is_ignored() {
    let data = json!({
        "inverters": [{
            "serial": SERIAL,
            "AC": { "0": { "Power": { "v": "n/a" }, "Voltage": { "v": 230.0 } } }
        }],
        "total": { "Power": { "v": 0.0 } }
    });
    let parsed = parse_live_status(SERIAL, &data).expect("parse");
    assert_eq!(parsed.power_w, None);
    assert_eq!(parsed.voltage_mv, Some(230_000));
    assert_eq!(parsed.derived_max_power_w(), None);
}

#[test]
fn non_numeric_total_power_is_invalid() {
    let data = json!({
        "inverters": [{ "serial": SERIAL }],
        "total": { "Power": { "v": null } }
    });
    let err = parse_live_status(SERIAL, &data).expect_err("invalid");
    assert!(matches!(err, ParseError::InvalidField("total.Power.v")));
}

#[test]
fn parse_limit_status_skips_malformed_entries() {
    let data = fixture(include_str!("fixtures/limit_status.json"));
    let entries = parse_limit_status(&data).expect("parse");

    assert_eq!(entries.len(), 2);
    let first = entries
        .iter()
        .find(|entry| entry.serial == SERIAL)
        .expect("first");
    assert_eq!(first.max_power_w, Some(800));
    assert_eq!(first.limit_relative_pct, Some(50));
    assert_eq!(first.status, LimitStatus::Ok);

    let second = entries
        .iter()
        .find(|entry| entry.serial == "114182967890")
        .expect("second");
    assert_eq!(second.status, LimitStatus::Pending);
}

#[test]
fn limit_status_requires_object_root() {
    assert!(parse_limit_status(&json!([1, 2, 3])).is_err());
}
