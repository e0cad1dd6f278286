/*!
 * NETVIGIL KERNEL - Pipeline de télémétrie réseau
 *
 * Ingestion collecteur → classification → écriture groupée + détection de
 * flapping → pub/sub cache → observateurs WebSocket.
 */

pub mod cache;
pub mod config;
pub mod directory;
pub mod flapping;
pub mod health;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod models;
pub mod schedule;
pub mod state;
pub mod writer;
