pub mod fakes;

#[allow(unused_imports)]
pub use fakes::{FakeProbe, FakeProducer, FakeStreamer, FlakyStore, site_config, test_setup};
