pub mod grading_service;
pub mod integrity_monitor;
pub mod judge_client;
pub mod pg_submission_store;
pub mod recording_service;
pub mod session_service;
pub mod signal_source;
pub mod submission_store;
pub mod violation_ledger;
