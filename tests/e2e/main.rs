//! End-to-end scenario runs against an in-process fake cloud CLI.

mod harness;
mod scenarios;
