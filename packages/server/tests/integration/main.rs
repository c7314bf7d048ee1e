mod common;

mod documents;
mod formats;
mod handles;
mod routing;
mod workers;
