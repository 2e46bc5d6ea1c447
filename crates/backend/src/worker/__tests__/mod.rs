mod batch;
mod helpers;
mod host;
mod processing;
