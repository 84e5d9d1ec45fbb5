mod backend;
mod service;
mod utils;
