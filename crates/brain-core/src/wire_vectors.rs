//! Wire vectors for the control and advertisement schemas
//!
//! Drivers written against the JSON contract rely on these exact shapes.

use crate::types::*;
use serde_json::{json, Value};

/// A named wire vector: the typed message and its exact JSON form
struct WireVector {
    name: &'static str,
    json: Value,
    control: Option<ControlMessage>,
    advertisement: Option<Advertisement>,
}

fn vectors() -> Vec<WireVector> {
    vec![
        WireVector {
            name: "tick",
            json: json!({"command": "tick"}),
            control: Some(ControlMessage::Tick),
            advertisement: None,
        },
        WireVector {
            name: "close",
            json: json!({"command": "close", "address": "6f1c1e0a-93a4-4b8e-9d7e-0c2f5e3b9a10"}),
            control: Some(ControlMessage::close(ChannelId::from(
                "6f1c1e0a-93a4-4b8e-9d7e-0c2f5e3b9a10",
            ))),
            advertisement: None,
        },
        WireVector {
            name: "advertisement",
            json: json!({"address": "abc123"}),
            control: None,
            advertisement: Some(Advertisement::new(ChannelId::from("abc123"))),
        },
    ]
}

#[test]
fn encodings_match_vectors() {
    for v in vectors() {
        if let Some(control) = &v.control {
            assert_eq!(control.to_json(), v.json, "vector {}", v.name);
        }
        if let Some(ad) = &v.advertisement {
            assert_eq!(ad.to_json(), v.json, "vector {}", v.name);
        }
    }
}

#[test]
fn decodings_match_vectors() {
    for v in vectors() {
        if let Some(control) = v.control {
            assert_eq!(ControlMessage::from_json(&v.json).unwrap(), control, "vector {}", v.name);
        }
        if let Some(ad) = v.advertisement {
            assert_eq!(Advertisement::from_json(&v.json).unwrap(), ad, "vector {}", v.name);
        }
    }
}

#[test]
fn extra_fields_are_tolerated() {
    let tick = json!({"command": "tick", "origin": "driver-1"});
    assert_eq!(ControlMessage::from_json(&tick).unwrap(), ControlMessage::Tick);

    let ad = json!({"address": "abc123", "ttl": 3});
    assert_eq!(
        Advertisement::from_json(&ad).unwrap().address,
        ChannelId::from("abc123")
    );
}
