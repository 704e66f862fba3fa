mod helpers;

mod event_tests;
mod fiber_tests;
