//! skylive - ingestion and fan-out backbone for live paragliding
//! competition tracking.
//!
//! Position reports arrive from mobile apps over HTTP, from GPS trackers
//! over two binary TCP protocols, and as batch uploads. Everything funnels
//! through a Redis-backed priority queue into a time-partitioned Postgres
//! store, and a WebSocket tier pushes delayed, viewport-scoped deltas to
//! map clients on a fixed cadence.

pub mod actions;
pub mod auth;
pub mod commands;
pub mod config;
pub mod devices;
pub mod devices_repo;
pub mod flight_tracker;
pub mod flights;
pub mod flights_repo;
pub mod live_hub;
pub mod mercator;
pub mod metrics;
pub mod point_queue;
pub mod point_writer;
pub mod queue_config;
pub mod races;
pub mod races_repo;
pub mod retention;
pub mod schema;
pub mod track_points;
pub mod track_points_repo;
pub mod tracker_protocol;
pub mod tracker_server;
pub mod validator;
pub mod vector_tile;
pub mod web;

pub use flight_tracker::{FlightTracker, IncomingPoint, LandingConfig};
pub use flights::{Flight, FlightSource};
pub use point_queue::{PointQueue, QueueError, QueueItem, QueuePoint};
pub use queue_config::QueueKind;
