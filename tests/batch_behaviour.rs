//! Behavioural scenarios for fleet batch dispatch.

mod batch;
