/// Broker runtime configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Port for both the datagram and the stream endpoint. Zero asks for an
    /// ephemeral port (tests); operators always pass an explicit one.
    pub port: u16,
    /// Pending-connection queue depth for the stream listener.
    pub listen_backlog: i32,
    /// Whether operator standard input is watched for the exit command.
    /// Embedders and tests turn this off and use the shutdown handle.
    pub operator_input: bool,
}

impl BrokerConfig {
    pub fn new(port: u16) -> Self {
        Self { port, listen_backlog: 10, operator_input: true }
    }

    pub fn with_listen_backlog(mut self, depth: i32) -> Self {
        self.listen_backlog = depth;
        self
    }

    pub fn with_operator_input(mut self, enabled: bool) -> Self {
        self.operator_input = enabled;
        self
    }
}
