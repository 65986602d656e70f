//! Shared plumbing for the mock driven processes in this package.
//!
//! The mocks stand in for `airspy_tcp` and the GNU Radio bridge in
//! end-to-end tests. Their behavior is tuned through environment variables
//! so a test can wrap a mock in a small shell script.

pub mod mock;
