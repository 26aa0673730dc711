//! Recognized header names.

/// Username presented on CONNECT.
pub const LOGIN: &str = "login";

/// Credential presented on CONNECT.
pub const PASSCODE: &str = "passcode";

/// Channel name on SUBSCRIBE, SEND and MESSAGE.
pub const DESTINATION: &str = "destination";

/// Client-chosen subscription id on SUBSCRIBE and UNSUBSCRIBE.
pub const ID: &str = "id";

/// Receipt request on any client frame.
pub const RECEIPT: &str = "receipt";

/// Echo of the receipt request on RECEIPT.
pub const RECEIPT_ID: &str = "receipt-id";

/// Subscription id a MESSAGE is delivered under.
pub const SUBSCRIPTION: &str = "subscription";

/// Server-assigned MESSAGE identifier.
pub const MESSAGE_ID: &str = "message-id";

/// Protocol version on CONNECTED.
pub const VERSION: &str = "version";

/// Short error summary on ERROR.
pub const MESSAGE: &str = "message";

/// Marks a SEND as file-upload metadata.
pub const FILE_NAME: &str = "file-name";
