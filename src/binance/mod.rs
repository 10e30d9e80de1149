// =============================================================================
// Binance — the engine's one concrete external-venue integration
// =============================================================================
//
// `client` is the signed REST client consumed by both the Data Provider
// (klines) and the Broker Connector (account/order endpoints). `rate_limit`
// is the weight/order tracker the client consults before every call, per the
// engine's "rate limits live inside provider implementations" contract.

pub mod client;
pub mod rate_limit;
