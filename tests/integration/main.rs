//! Integration tests: full hunt runs through the public API with stub
//! evaluators and probes.

mod stub_evaluators;
mod hunt_scenarios;
