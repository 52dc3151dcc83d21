//! Static event-kind registry.
//!
//! Maps the `event:` name of an inbound SSE message to the typed bus event
//! it decodes into. Instances omit their own identity and timestamp; both
//! are filled in here, and an identity sent by the instance is overwritten.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use fleet_core::{
    ChatEvent, FleetEvent, LogEvent, NodeUsage, PlayerEvent, ServerId, StartEvent, StopEvent,
};

type Parser = fn(ServerId, &str) -> serde_json::Result<FleetEvent>;

static REGISTRY: &[(&str, Parser)] = &[
    ("log", parse_log),
    ("start", parse_start),
    ("stop", parse_stop),
    ("usage", parse_usage),
    ("player_join", parse_player_join),
    ("player_leave", parse_player_leave),
    ("chat", parse_chat),
];

/// Registered kind names.
pub fn kinds() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Decode one inbound message. `Ok(None)` means the kind is not registered.
pub fn parse(
    server_id: ServerId,
    kind: &str,
    data: &str,
) -> serde_json::Result<Option<FleetEvent>> {
    match REGISTRY.iter().find(|(name, _)| *name == kind) {
        Some((_, parser)) => parser(server_id, data).map(Some),
        None => Ok(None),
    }
}

fn decode<T: DeserializeOwned>(server_id: ServerId, data: &str) -> serde_json::Result<T> {
    let mut value: Value = if data.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(data)?
    };
    if let Value::Object(map) = &mut value {
        map.insert("server_id".to_string(), json!(server_id));
        map.entry("at").or_insert_with(|| json!(Utc::now()));
    }
    serde_json::from_value(value)
}

fn parse_log(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<LogEvent>(id, data).map(FleetEvent::Log)
}

fn parse_start(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<StartEvent>(id, data).map(FleetEvent::Start)
}

fn parse_stop(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<StopEvent>(id, data).map(FleetEvent::Stop)
}

fn parse_usage(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<NodeUsage>(id, data).map(FleetEvent::Usage)
}

fn parse_player_join(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<PlayerEvent>(id, data).map(FleetEvent::PlayerJoin)
}

fn parse_player_leave(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<PlayerEvent>(id, data).map(FleetEvent::PlayerLeave)
}

fn parse_chat(id: ServerId, data: &str) -> serde_json::Result<FleetEvent> {
    decode::<ChatEvent>(id, data).map(FleetEvent::Chat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::LogLevel;
    use uuid::Uuid;

    #[test]
    fn fills_identity_and_timestamp() {
        let id = Uuid::new_v4();
        let event = parse(id, "log", r#"{"level":"warn","message":"low tps"}"#)
            .unwrap()
            .unwrap();
        match event {
            FleetEvent::Log(log) => {
                assert_eq!(log.server_id, id);
                assert_eq!(log.level, LogLevel::Warn);
                assert_eq!(log.message, "low tps");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn instance_cannot_spoof_identity() {
        let id = Uuid::new_v4();
        let data = format!(r#"{{"server_id":"{}","reason":"shutdown"}}"#, Uuid::new_v4());
        let event = parse(id, "stop", &data).unwrap().unwrap();
        assert_eq!(event.server_id(), id);
    }

    #[test]
    fn empty_payload_is_enough_for_start() {
        let id = Uuid::new_v4();
        let event = parse(id, "start", "").unwrap().unwrap();
        assert!(matches!(event, FleetEvent::Start(e) if e.server_id == id));
    }

    #[test]
    fn player_kinds_map_to_distinct_variants() {
        let id = Uuid::new_v4();
        let data = r#"{"player":{"uuid":"p1","name":"Ana"}}"#;
        assert!(matches!(parse(id, "player_join", data), Ok(Some(FleetEvent::PlayerJoin(_)))));
        assert!(matches!(parse(id, "player_leave", data), Ok(Some(FleetEvent::PlayerLeave(_)))));
    }

    #[test]
    fn unknown_kind_is_none_and_bad_payload_is_error() {
        let id = Uuid::new_v4();
        assert!(parse(id, "vote_started", "{}").unwrap().is_none());
        assert!(parse(id, "chat", "{not json").is_err());
        assert!(parse(id, "log", "{}").is_err());
    }

    #[test]
    fn every_kind_is_registered_once() {
        let mut names: Vec<_> = kinds().collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
