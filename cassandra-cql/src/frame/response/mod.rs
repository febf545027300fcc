pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::{CqlResponseParseError, SerializationError};
use crate::frame::value_codec::TypeCodec;

pub use error::Error;
pub use supported::Supported;

use super::TryFromPrimitiveError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl ResponseOpcode {
    pub fn kind(self) -> CqlResponseKind {
        match self {
            ResponseOpcode::Error => CqlResponseKind::Error,
            ResponseOpcode::Ready => CqlResponseKind::Ready,
            ResponseOpcode::Authenticate => CqlResponseKind::Authenticate,
            ResponseOpcode::Supported => CqlResponseKind::Supported,
            ResponseOpcode::Result => CqlResponseKind::Result,
            ResponseOpcode::Event => CqlResponseKind::Event,
            ResponseOpcode::AuthChallenge => CqlResponseKind::AuthChallenge,
            ResponseOpcode::AuthSuccess => CqlResponseKind::AuthSuccess,
        }
    }
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    /// Parses a decompressed body with extensions already stripped.
    /// `codec` fixes the protocol version and decodes row cells.
    pub fn deserialize(
        codec: &TypeCodec,
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> Result<Response, CqlResponseParseError> {
        let malformed = |error| CqlResponseParseError::Malformed {
            kind: opcode.kind(),
            error,
        };
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => Response::Authenticate(
                authenticate::Authenticate::deserialize(buf).map_err(malformed)?,
            ),
            ResponseOpcode::Supported => {
                Response::Supported(Supported::deserialize(buf).map_err(malformed)?)
            }
            ResponseOpcode::Result => Response::Result(result::deserialize(buf, codec)?),
            ResponseOpcode::Event => {
                Response::Event(event::Event::deserialize(buf, codec.version())?)
            }
            ResponseOpcode::AuthChallenge => Response::AuthChallenge(
                authenticate::AuthChallenge::deserialize(buf).map_err(malformed)?,
            ),
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(
                authenticate::AuthSuccess::deserialize(buf).map_err(malformed)?,
            ),
        };

        Ok(response)
    }

    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
            Response::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Event(_) => ResponseOpcode::Event,
        }
    }

    /// Encodes the body as a server would send it.
    pub fn serialize(&self, buf: &mut Vec<u8>, codec: &TypeCodec) -> Result<(), SerializationError> {
        match self {
            Response::Error(error) => error.serialize(buf)?,
            Response::Ready => {}
            Response::Result(result) => result.serialize(buf, codec)?,
            Response::Authenticate(auth) => auth.serialize(buf)?,
            Response::AuthSuccess(success) => success.serialize(buf)?,
            Response::AuthChallenge(challenge) => challenge.serialize(buf)?,
            Response::Supported(supported) => supported.serialize(buf)?,
            Response::Event(event) => event.serialize(buf, codec.version())?,
        }
        Ok(())
    }

    pub fn into_non_error_response(self) -> Result<NonErrorResponse, Error> {
        Ok(match self {
            Response::Error(err) => return Err(err),
            Response::Ready => NonErrorResponse::Ready,
            Response::Result(res) => NonErrorResponse::Result(res),
            Response::Authenticate(auth) => NonErrorResponse::Authenticate(auth),
            Response::AuthSuccess(auth_succ) => NonErrorResponse::AuthSuccess(auth_succ),
            Response::AuthChallenge(auth_chal) => NonErrorResponse::AuthChallenge(auth_chal),
            Response::Supported(sup) => NonErrorResponse::Supported(sup),
            Response::Event(eve) => NonErrorResponse::Event(eve),
        })
    }
}

// A Response which can not be Response::Error
#[derive(Debug, Clone, PartialEq)]
pub enum NonErrorResponse {
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl NonErrorResponse {
    pub fn kind(&self) -> CqlResponseKind {
        match self {
            NonErrorResponse::Ready => CqlResponseKind::Ready,
            NonErrorResponse::Result(_) => CqlResponseKind::Result,
            NonErrorResponse::Authenticate(_) => CqlResponseKind::Authenticate,
            NonErrorResponse::AuthSuccess(_) => CqlResponseKind::AuthSuccess,
            NonErrorResponse::AuthChallenge(_) => CqlResponseKind::AuthChallenge,
            NonErrorResponse::Supported(_) => CqlResponseKind::Supported,
            NonErrorResponse::Event(_) => CqlResponseKind::Event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DbError;
    use crate::frame::response::event::{Event, StatusChangeEvent};
    use crate::ProtocolVersion;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[test]
    fn responses_parse_back() {
        let codec = TypeCodec::for_version(ProtocolVersion::V3);
        let responses = [
            Response::Ready,
            Response::Error(Error::new(DbError::Overloaded, "busy")),
            Response::Authenticate(authenticate::Authenticate {
                authenticator_name: "org.apache.cassandra.auth.PasswordAuthenticator".to_owned(),
            }),
            Response::AuthSuccess(authenticate::AuthSuccess {
                success_message: None,
            }),
            Response::AuthChallenge(authenticate::AuthChallenge {
                authenticate_message: Some(b"token".to_vec()),
            }),
            Response::Supported(Supported {
                options: HashMap::from([(
                    "COMPRESSION".to_owned(),
                    vec!["lz4".to_owned(), "snappy".to_owned()],
                )]),
            }),
            Response::Event(Event::StatusChange(StatusChangeEvent::Down(
                "127.0.0.1:9042".parse().unwrap(),
            ))),
            Response::Result(result::Result::Void),
        ];
        for response in responses {
            let mut buf = Vec::new();
            response.serialize(&mut buf, &codec).unwrap();
            let parsed = Response::deserialize(&codec, response.opcode(), &mut &buf[..]).unwrap();
            assert_eq!(parsed, response);
        }
    }

    #[test]
    fn malformed_bodies_report_their_kind() {
        let codec = TypeCodec::for_version(ProtocolVersion::V4);
        let err = Response::deserialize(&codec, ResponseOpcode::Supported, &mut &[0u8][..])
            .unwrap_err();
        assert_eq!(err.to_response_kind(), CqlResponseKind::Supported);

        let err =
            Response::deserialize(&codec, ResponseOpcode::Result, &mut &[0u8, 0, 0, 9][..])
                .unwrap_err();
        assert_matches!(err, CqlResponseParseError::CqlResultParseError(_));
        assert_eq!(err.to_response_kind(), CqlResponseKind::Result);
    }

    #[test]
    fn opcodes_map_to_kinds() {
        assert_eq!(ResponseOpcode::try_from(0x10).unwrap(), ResponseOpcode::AuthSuccess);
        assert!(ResponseOpcode::try_from(0x01).is_err());
        assert_eq!(ResponseOpcode::Event.kind(), CqlResponseKind::Event);
    }
}
