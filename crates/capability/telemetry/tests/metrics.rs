use ems_telemetry::{init_tracing, metrics, record_connect_attempts, record_outbound_dropped_n};

#[test]
fn counters_accumulate_in_snapshot() {
    init_tracing();
    init_tracing();
    let before = metrics().snapshot();
    record_connect_attempts();
    record_outbound_dropped_n(3);
    let after = metrics().snapshot();
    assert!(after.connect_attempts >= before.connect_attempts + 1);
    assert!(after.outbound_dropped >= before.outbound_dropped + 3);
}
