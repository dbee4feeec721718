mod common;

mod recording;
mod scenarios;
