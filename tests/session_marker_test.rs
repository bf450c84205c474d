use ct_replicator::session::{self, SessionMarker};
use std::fs;
use tempfile::tempdir;

#[test]
fn test_marker_survives_crash_and_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("current_session.json");

    // A run that gets as far as the "billing" set before dying leaves the
    // marker behind; the next start reads it back verbatim.
    session::save(
        &path,
        &SessionMarker {
            in_progress: true,
            destination_name: "billing".to_string(),
        },
    )
    .unwrap();

    let resumed = session::load(&path).unwrap();
    assert!(resumed.in_progress);
    assert_eq!(resumed.destination_name, "billing");

    // Completion clears it.
    session::clear(&path).unwrap();
    let cleared = session::load(&path).unwrap();
    assert!(!cleared.in_progress);
    assert!(cleared.destination_name.is_empty());
}

#[test]
fn test_marker_is_external_json_shape() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("current_session.json");

    fs::write(
        &path,
        r#"{"InProgress": true, "DestinationName": "orders"}"#,
    )
    .unwrap();

    let marker = session::load(&path).unwrap();
    assert!(marker.in_progress);
    assert_eq!(marker.destination_name, "orders");
}
