//! Native values as Lua tables
//!
//! Path tables use the field names script authors see in the path metadata
//! documentation: `Source`, `Destination`, `Fingerprint`, `Expiry` (seconds
//! since the epoch) and `Metadata` with `MTU`, `Interfaces`, `Latency`
//! (seconds), `Bandwidth`, `LinkType`, `InternalHops`, `Notes` and `Geo`.

use std::time::{SystemTime, UNIX_EPOCH};

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Table, Value};

use panpolicy_core::{ConnectionEvent, GeoCoordinates, Path, PathInterface, PathMetadata};

pub fn interface_to_table(lua: &Lua, interface: &PathInterface) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("IA", interface.ia.as_str())?;
    t.set("IfID", interface.ifid)?;
    Ok(t)
}

fn geo_to_table(lua: &Lua, geo: &GeoCoordinates) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("Latitude", geo.latitude)?;
    t.set("Longitude", geo.longitude)?;
    t.set("Address", geo.address.as_str())?;
    Ok(t)
}

fn metadata_to_table(lua: &Lua, meta: &PathMetadata) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("MTU", meta.mtu)?;

    let interfaces = meta
        .interfaces
        .iter()
        .map(|i| interface_to_table(lua, i))
        .collect::<mlua::Result<Vec<_>>>()?;
    t.set("Interfaces", lua.create_sequence_from(interfaces)?)?;
    t.set(
        "Latency",
        lua.create_sequence_from(meta.latency.iter().map(|d| d.as_secs_f64()))?,
    )?;
    t.set("Bandwidth", lua.create_sequence_from(meta.bandwidth.iter().copied())?)?;
    t.set(
        "LinkType",
        lua.create_sequence_from(meta.link_type.iter().map(|l| l.code()))?,
    )?;
    t.set(
        "InternalHops",
        lua.create_sequence_from(meta.internal_hops.iter().copied())?,
    )?;
    t.set("Notes", lua.create_sequence_from(meta.notes.iter().map(String::as_str))?)?;

    let geo = meta
        .geo
        .iter()
        .map(|g| geo_to_table(lua, g))
        .collect::<mlua::Result<Vec<_>>>()?;
    t.set("Geo", lua.create_sequence_from(geo)?)?;
    Ok(t)
}

/// Fresh table describing `path`
///
/// Every call creates a new table; table identity is what the selector maps
/// back to the native path.
pub fn path_to_table(lua: &Lua, path: &Path) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("Source", path.source.as_str())?;
    t.set("Destination", path.destination.as_str())?;
    t.set("Fingerprint", path.fingerprint.as_str())?;
    t.set("Expiry", epoch_seconds(path.expiry))?;
    if let Some(meta) = &path.metadata {
        t.set("Metadata", metadata_to_table(lua, meta)?)?;
    }
    Ok(t)
}

fn epoch_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

/// Event payload as passed to a `stats` entry point
///
/// Field-less events have no payload and become `nil`; absent optional
/// fields become `nil` as well.
pub fn event_to_value(lua: &Lua, event: &ConnectionEvent) -> mlua::Result<Value> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    match lua.to_value_with(event, options)? {
        // Struct variants serialize as { Variant = { fields } }
        Value::Table(tagged) => match tagged.pairs::<Value, Value>().next() {
            Some(pair) => Ok(pair?.1),
            None => Ok(Value::Nil),
        },
        _ => Ok(Value::Nil),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panpolicy_core::LinkType;
    use std::time::Duration;

    fn sample() -> Path {
        Path::new(
            "1-ff00:0:110",
            "1-ff00:0:112",
            "fp-a",
            UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        )
        .with_metadata(PathMetadata {
            mtu: 1472,
            interfaces: vec![
                PathInterface::new("1-ff00:0:110", 1),
                PathInterface::new("1-ff00:0:112", 5),
            ],
            latency: vec![Duration::from_millis(1500)],
            bandwidth: vec![100_000],
            link_type: vec![LinkType::Direct],
            internal_hops: vec![2],
            notes: vec!["core link".into()],
            geo: vec![GeoCoordinates {
                latitude: 47.5,
                longitude: 8.5,
                address: "Zurich".into(),
            }],
        })
    }

    #[test]
    fn test_path_table_fields() {
        let lua = Lua::new();
        let t = path_to_table(&lua, &sample()).expect("Failed to convert path");

        assert_eq!(t.get::<String>("Source").unwrap(), "1-ff00:0:110");
        assert_eq!(t.get::<String>("Destination").unwrap(), "1-ff00:0:112");
        assert_eq!(t.get::<String>("Fingerprint").unwrap(), "fp-a");
        assert_eq!(t.get::<i64>("Expiry").unwrap(), 1_700_000_000);

        let meta: Table = t.get("Metadata").unwrap();
        assert_eq!(meta.get::<u16>("MTU").unwrap(), 1472);
        let interfaces: Table = meta.get("Interfaces").unwrap();
        assert_eq!(interfaces.raw_len(), 2);
        let second: Table = interfaces.get(2).unwrap();
        assert_eq!(second.get::<String>("IA").unwrap(), "1-ff00:0:112");
        assert_eq!(second.get::<u64>("IfID").unwrap(), 5);

        let latency: Table = meta.get("Latency").unwrap();
        assert_eq!(latency.get::<f64>(1).unwrap(), 1.5);
        let link_type: Table = meta.get("LinkType").unwrap();
        assert_eq!(link_type.get::<u8>(1).unwrap(), 1);
        let geo: Table = meta.get("Geo").unwrap();
        let first: Table = geo.get(1).unwrap();
        assert_eq!(first.get::<String>("Address").unwrap(), "Zurich");
    }

    #[test]
    fn test_path_without_metadata_has_no_metadata_table() {
        let lua = Lua::new();
        let path = Path::new("a", "b", "fp", UNIX_EPOCH);
        let t = path_to_table(&lua, &path).unwrap();
        assert!(matches!(t.get::<Value>("Metadata").unwrap(), Value::Nil));
    }

    #[test]
    fn test_each_conversion_is_a_new_table() {
        let lua = Lua::new();
        let path = sample();
        let a = path_to_table(&lua, &path).unwrap();
        let b = path_to_table(&lua, &path).unwrap();
        assert_ne!(a.to_pointer(), b.to_pointer());
    }

    #[test]
    fn test_event_payload() {
        let lua = Lua::new();
        let value = event_to_value(
            &lua,
            &ConnectionEvent::Debug {
                name: "cc".into(),
                message: "hello".into(),
            },
        )
        .unwrap();
        let Value::Table(t) = value else {
            panic!("expected a table payload");
        };
        assert_eq!(t.get::<String>("message").unwrap(), "hello");

        let unit = event_to_value(&lua, &ConnectionEvent::Close).unwrap();
        assert!(matches!(unit, Value::Nil));

        let closed = event_to_value(&lua, &ConnectionEvent::ClosedConnection { reason: None }).unwrap();
        let Value::Table(t) = closed else {
            panic!("expected a table payload");
        };
        assert!(matches!(t.get::<Value>("reason").unwrap(), Value::Nil));
    }
}
