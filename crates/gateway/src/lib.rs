//! HTTP surface and process wiring.
//!
//! Startup:
//! 1. Open the session database and settings file
//! 2. Pick the transport (`native` or `bridge`) and build the session
//!    manager, supervisor and onboarding dispatcher
//! 3. Serve `/qr`, `/settings`, `/logout`, `/pair`, `/status` and `/health`
//! 4. Run until the listener fails, the supervisor hits a configuration
//!    error, or Ctrl-C

pub mod auth;
pub mod pairing;
pub mod server;
pub mod state;
pub mod transport;
