//! Wire shapes for the chat room protocol.
//!
//! Every frame is a JSON object with a `Type` field.  Outbound messages
//! additionally carry a `Time` field stamped by the room at send, which is
//! why it does not appear in the shapes here.

use serde::{Deserialize, Serialize};

/// Messages a client may send.  Unrecognized `Type` values decode to
/// `Unknown` and are dropped without comment.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum ClientMessage {
    SetNickName {
        #[serde(rename = "NickName", default)]
        nickname: String,
    },
    GetNickNames,
    GetAvailableNickNames,
    GetUsers,
    Tell {
        #[serde(rename = "Tell", default)]
        tell: String,
    },
    #[serde(other)]
    Unknown,
}

/// Messages the room sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Type")]
pub enum ServerMessage {
    SetNickNameResult {
        #[serde(rename = "Success")]
        success: bool,
    },
    Join {
        #[serde(rename = "NickName")]
        nickname: String,
    },
    Leave {
        #[serde(rename = "NickName")]
        nickname: String,
    },
    NickNames {
        #[serde(rename = "NickNames")]
        nicknames: Vec<String>,
    },
    AvailableNickNames {
        #[serde(rename = "AvailableNickNames")]
        available: Vec<String>,
    },
    Users {
        #[serde(rename = "Users")]
        users: Vec<UserEntry>,
    },
    Tell {
        #[serde(rename = "Sender")]
        sender: String,
        #[serde(rename = "Tell")]
        tell: String,
    },
    Award {
        #[serde(rename = "Subject")]
        subject: String,
        #[serde(rename = "Award")]
        award: i64,
        #[serde(rename = "Points")]
        points: i64,
    },
    Penalty {
        #[serde(rename = "Subject")]
        subject: String,
        #[serde(rename = "Penalty")]
        penalty: i64,
        #[serde(rename = "Points")]
        points: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEntry {
    #[serde(rename = "Nickname")]
    pub nickname: String,
    #[serde(rename = "Points")]
    pub points: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_set_nickname() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"Type":"SetNickName","NickName":"Bob"}"#).unwrap();
        assert!(matches!(message, ClientMessage::SetNickName { nickname } if nickname == "Bob"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let message: ClientMessage = serde_json::from_str(r#"{"Type":"Tell"}"#).unwrap();
        assert!(matches!(message, ClientMessage::Tell { tell } if tell.is_empty()));
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"Type":"FlipTable","Force":9001}"#).unwrap();
        assert!(matches!(message, ClientMessage::Unknown));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"NickName":"Bob"}"#).is_err());
    }

    #[test]
    fn encodes_award_with_renamed_fields() {
        let message = ServerMessage::Award {
            subject: "Bob".to_string(),
            award: 1,
            points: 6,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"Type": "Award", "Subject": "Bob", "Award": 1, "Points": 6})
        );
    }

    #[test]
    fn encodes_users_in_given_order() {
        let message = ServerMessage::Users {
            users: vec![
                UserEntry {
                    nickname: "Bob".to_string(),
                    points: 5,
                },
                UserEntry {
                    nickname: "Alice".to_string(),
                    points: 0,
                },
            ],
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"Type": "Users", "Users": [
                {"Nickname": "Bob", "Points": 5},
                {"Nickname": "Alice", "Points": 0}
            ]})
        );
    }
}
