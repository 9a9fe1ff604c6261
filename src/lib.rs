//! Beacon - a geospatial alert and emergency dispatch engine.
//!
//! # Overview
//!
//! Beacon is the alerting core of a disaster-response platform. Given a
//! feed of disaster events and a registry of users with last-known
//! locations, it:
//!
//! - scores each user's risk from nearby active disasters
//! - derives concentric danger-zone rings around each disaster
//! - targets, translates, and queues alerts for everyone in an affected
//!   area, with per-channel retry and dead-lettering
//! - runs the SOS lifecycle from a victim's request through responder
//!   assignment to resolution
//! - pushes real-time events to clients sharded by location grid cell
//!
//! # Trust model
//!
//! Beacon sits behind a gateway that authenticates users; requests carry
//! a resolved `x-user-id` header. Role enforcement (user / responder /
//! admin) happens here.
//!
//! # API Endpoints
//!
//! - `POST /emergency/sos` - Create an SOS request
//! - `PATCH /emergency/sos/:id/assign` - Responder claims a request
//! - `PATCH /emergency/sos/:id` - Advance the lifecycle
//! - `PATCH /emergency/sos/:id/cancel` - Requester withdraws
//! - `GET /emergency/sos/:id` - Tracking view
//! - `GET /disasters/risk-assessment` - Caller's risk picture
//! - `GET /disasters/:id/zones` - Danger-zone rings
//! - `GET /disasters/zones/check` - Caller vs. all active zones
//! - `POST /alerts/broadcast` - Admin alert batch
//! - `GET /health` - Health check

pub mod alerts;
pub mod api;
pub mod delivery;
pub mod error;
pub mod geo;
pub mod model;
pub mod realtime;
pub mod risk;
pub mod sos;
pub mod storage;
pub mod translate;
pub mod zones;
