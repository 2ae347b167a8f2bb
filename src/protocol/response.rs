use bincode::{Decode, Encode};
use serde_json::Value;

use crate::{Token, error::QueryError};

/// Known response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseKind {
    SuccessEmpty = 0,
    SuccessJson = 1,
    SuccessPartial = 2,
    SuccessStream = 3,
    BrokenClient = 101,
    BadQuery = 102,
    RuntimeError = 103,
}

impl ResponseKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseKind::BrokenClient | ResponseKind::BadQuery | ResponseKind::RuntimeError
        )
    }
}

impl TryFrom<u32> for ResponseKind {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ResponseKind::SuccessEmpty),
            1 => Ok(ResponseKind::SuccessJson),
            2 => Ok(ResponseKind::SuccessPartial),
            3 => Ok(ResponseKind::SuccessStream),
            101 => Ok(ResponseKind::BrokenClient),
            102 => Ok(ResponseKind::BadQuery),
            103 => Ok(ResponseKind::RuntimeError),
            unknown => Err(unknown),
        }
    }
}

/// Server to client message.
///
/// `status` stays a raw code so responses with a status this driver does not know still
/// decode and can be failed against their token. Payload items are JSON documents.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Response {
    pub token: Token,
    pub status: u32,
    pub payload: Vec<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<Vec<String>>,
}

impl Response {
    fn success(token: Token, kind: ResponseKind, items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            token,
            status: kind.code(),
            payload: items.into_iter().map(|item| item.to_string()).collect(),
            error_message: None,
            backtrace: None,
        }
    }

    pub fn empty(token: Token) -> Self {
        Self::success(token, ResponseKind::SuccessEmpty, Vec::<Value>::new())
    }

    pub fn atom(token: Token, value: Value) -> Self {
        Self::success(token, ResponseKind::SuccessJson, [value])
    }

    pub fn partial(token: Token, items: impl IntoIterator<Item = Value>) -> Self {
        Self::success(token, ResponseKind::SuccessPartial, items)
    }

    pub fn stream(token: Token, items: impl IntoIterator<Item = Value>) -> Self {
        Self::success(token, ResponseKind::SuccessStream, items)
    }

    pub fn error(
        token: Token,
        kind: ResponseKind,
        message: impl Into<String>,
        backtrace: Vec<String>,
    ) -> Self {
        Self {
            token,
            status: kind.code(),
            payload: Vec::new(),
            error_message: Some(message.into()),
            backtrace: Some(backtrace),
        }
    }

    /// The status as a known kind, or the raw code when it is not one.
    pub fn kind(&self) -> Result<ResponseKind, u32> {
        ResponseKind::try_from(self.status)
    }

    /// Parse the payload items in order.
    pub fn decode_payload(&self) -> Result<Vec<Value>, QueryError> {
        self.payload
            .iter()
            .map(|item| {
                serde_json::from_str(item)
                    .map_err(|e| QueryError::Protocol(format!("undecodable result item: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_codes() {
        for kind in [
            ResponseKind::SuccessEmpty,
            ResponseKind::SuccessJson,
            ResponseKind::SuccessPartial,
            ResponseKind::SuccessStream,
            ResponseKind::BrokenClient,
            ResponseKind::BadQuery,
            ResponseKind::RuntimeError,
        ] {
            assert_eq!(ResponseKind::try_from(kind.code()), Ok(kind));
        }
        assert_eq!(ResponseKind::try_from(4), Err(4));
    }

    #[test]
    fn error_kinds() {
        assert!(ResponseKind::RuntimeError.is_error());
        assert!(!ResponseKind::SuccessPartial.is_error());
    }

    #[test]
    fn payload_items_are_json() {
        let resp = Response::partial(Token::new(1), [json!(1), json!({"a": "b"})]);
        assert_eq!(resp.payload, vec!["1", r#"{"a":"b"}"#]);
        assert_eq!(resp.decode_payload().unwrap(), vec![json!(1), json!({"a": "b"})]);
    }

    #[test]
    fn undecodable_payload() {
        let mut resp = Response::stream(Token::new(1), Vec::<Value>::new());
        resp.payload.push(String::from("{not json"));

        assert!(matches!(resp.decode_payload(), Err(QueryError::Protocol(_))));
    }

    #[test]
    fn unknown_status_kind() {
        let mut resp = Response::empty(Token::new(1));
        resp.status = 77;
        assert_eq!(resp.kind(), Err(77));
    }
}
