use std::sync::Arc;

use reqwest::Client;

use crate::config::Config;
use crate::db::database::Database;
use crate::flow::controller::FlowController;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub http: Client,
    pub flow: FlowController,
}

impl AppState {
    pub fn new(config: Arc<Config>, db: Database, http: Client, flow: FlowController) -> Self {
        AppState {
            config,
            db,
            http,
            flow,
        }
    }
}
