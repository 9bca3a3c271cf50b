// End-to-end scenarios live in tests/smoke.rs; this crate has no library
// surface of its own.
