mod media_probe_tests;
mod options_probe_tests;
