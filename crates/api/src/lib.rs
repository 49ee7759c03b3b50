//! HTTP API: provider webhooks, health and job statistics.

pub mod app;
