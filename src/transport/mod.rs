/// TCP transport helpers (connect, listen, accept) with bounded waits.
pub mod tcp;
