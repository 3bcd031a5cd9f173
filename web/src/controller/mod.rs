pub(crate) mod health_check_controller;
pub(crate) mod ingest_controller;
pub(crate) mod stream_controller;
