use serde::Serialize;

use crate::rows::{AnchorRow, AnchorStatusRow, PositionRow, ScanLatestRow, StatsRow, WearableRow};

/// Server→client push-channel message.  The `type` tag discriminates; the
/// entity fields are flattened into the same object.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Anchor(AnchorRow),
    Wearable(WearableRow),
    Position(PositionRow),
    Stats(StatsRow),
    Scan(ScanLatestRow),
    AnchorStatus(AnchorStatusRow),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_messages_carry_snake_case_type_tags() {
        let msg = PushMessage::Stats(StatsRow {
            active_devices: 3,
            total_anchors: 2,
            total_wearables: 5,
            total_positions: 120,
            emergency_count: 0,
            ts: "2024-06-01T12:00:00+00:00".to_owned(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["active_devices"], 3);
        assert_eq!(json["emergency_count"], 0);

        let msg = PushMessage::AnchorStatus(AnchorStatusRow {
            anchor_id: "A-01".to_owned(),
            ts: None,
            ip: Some("10.0.0.7".to_owned()),
            fw: None,
            uptime_s: Some(12),
            wifi_rssi: None,
            heap_free: None,
            heap_min: None,
            chip_temp_c: None,
            tx_power_dbm: None,
            ble_scan_active: None,
            update_ts: "2024-06-01T12:00:00+00:00".to_owned(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "anchor_status");
        assert_eq!(json["anchor_id"], "A-01");
        assert_eq!(json["ip"], "10.0.0.7");
    }

    #[test]
    fn anchor_snapshot_message_has_entity_fields_inline() {
        let msg = PushMessage::Anchor(AnchorRow {
            id: "A-01".to_owned(),
            name: Some("Anchor 1".to_owned()),
            x: 5.0,
            y: 5.0,
            z: 2.5,
            created_at: "2024-06-01T12:00:00+00:00".to_owned(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "anchor");
        assert_eq!(json["id"], "A-01");
        assert_eq!(json["x"], 5.0);
    }
}
