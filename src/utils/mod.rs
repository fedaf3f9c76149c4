pub mod http;
pub mod imaging;
pub mod logging;
pub mod telegram;
pub mod timing;
