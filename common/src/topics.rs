pub const TOPIC_COMMANDS: &str = "pump/#";

pub const TOPIC_CMD_PING: &str = "pump/ping";
pub const TOPIC_CMD_STATUS: &str = "pump/status";
pub const TOPIC_CMD_RESTART: &str = "pump/restart";
pub const TOPIC_CMD_AUTO: &str = "pump/auto";

pub const TOPIC_OUT: &str = "outTopic";
pub const TOPIC_RELAY_STATUS: &str = "status";

pub const GREETING_PAYLOAD: &str = "hello world";
pub const RESET_PAYLOAD: &str = "reset";

pub const RELAY_ON_PAYLOAD: &str = "on";
// Deployed consumers match on this exact spelling.
pub const RELAY_OFF_PAYLOAD: &str = "offS";
pub const RELAY_OFF_PAYLOAD_NORMALIZED: &str = "off";
