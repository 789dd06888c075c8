//! Modbus TCP framing (MBAP header + PDU)
//!
//! ```text
//! ┌──────────────┬─────────────┬────────┬─────────┬──────────────────┐
//! │ transaction  │ protocol=0  │ length │ unit id │ PDU (fc + data)  │
//! │ u16          │ u16         │ u16    │ u8      │ length - 1 bytes │
//! └──────────────┴─────────────┴────────┴─────────┴──────────────────┘
//! ```

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::ProtocolError;

/// MBAP header length including the unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU a Modbus TCP frame may carry
pub const MAX_PDU_LEN: usize = 253;

/// Most coils or discrete inputs one read may request
pub const MAX_READ_BITS: u16 = 2000;

/// Most registers one read may request
pub const MAX_READ_REGISTERS: u16 = 125;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;
const EXCEPTION_FLAG: u8 = 0x80;

/// Function codes handled by the gateway and the simulator
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
}

/// Exception code returned by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Other(u8),
}

impl ExceptionCode {
    #[must_use]
    pub const fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Other(code) => code,
        }
    }

    /// Whether the request itself was wrong, as opposed to the device failing
    #[must_use]
    pub const fn is_request_fault(self) -> bool {
        matches!(
            self,
            Self::IllegalFunction | Self::IllegalDataAddress | Self::IllegalDataValue
        )
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("illegal function"),
            Self::IllegalDataAddress => f.write_str("illegal data address"),
            Self::IllegalDataValue => f.write_str("illegal data value"),
            Self::ServerDeviceFailure => f.write_str("server device failure"),
            Self::Other(code) => write!(f, "exception {code:#04x}"),
        }
    }
}

/// Request PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    #[must_use]
    pub const fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils { .. } => function::READ_COILS,
            Self::ReadDiscreteInputs { .. } => function::READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters { .. } => function::READ_INPUT_REGISTERS,
            Self::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
        }
    }

    /// Encode as PDU bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.function_code());
        match *self {
            Self::ReadCoils { address, quantity }
            | Self::ReadDiscreteInputs { address, quantity }
            | Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                buf.put_u16(address);
                buf.put_u16(quantity);
            }
            Self::WriteSingleCoil { address, value } => {
                buf.put_u16(address);
                buf.put_u16(if value { COIL_ON } else { COIL_OFF });
            }
            Self::WriteSingleRegister { address, value } => {
                buf.put_u16(address);
                buf.put_u16(value);
            }
        }
        buf.freeze()
    }

    /// Decode a request PDU (server side)
    ///
    /// # Errors
    ///
    /// Returns the exception code the server should answer with
    pub fn decode(pdu: &[u8]) -> Result<Self, ExceptionCode> {
        let (&code, mut body) = pdu.split_first().ok_or(ExceptionCode::IllegalFunction)?;
        if !(function::READ_COILS..=function::WRITE_SINGLE_REGISTER).contains(&code) {
            return Err(ExceptionCode::IllegalFunction);
        }
        if body.len() != 4 {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let address = body.get_u16();
        let word = body.get_u16();

        let request = match code {
            function::READ_COILS => Self::ReadCoils { address, quantity: word },
            function::READ_DISCRETE_INPUTS => Self::ReadDiscreteInputs { address, quantity: word },
            function::READ_HOLDING_REGISTERS => Self::ReadHoldingRegisters { address, quantity: word },
            function::READ_INPUT_REGISTERS => Self::ReadInputRegisters { address, quantity: word },
            function::WRITE_SINGLE_COIL => match word {
                COIL_ON => Self::WriteSingleCoil { address, value: true },
                COIL_OFF => Self::WriteSingleCoil { address, value: false },
                _ => return Err(ExceptionCode::IllegalDataValue),
            },
            _ => Self::WriteSingleRegister { address, value: word },
        };

        let quantity_ok = match request {
            Self::ReadCoils { quantity, .. } | Self::ReadDiscreteInputs { quantity, .. } => {
                (1..=MAX_READ_BITS).contains(&quantity)
            }
            Self::ReadHoldingRegisters { quantity, .. }
            | Self::ReadInputRegisters { quantity, .. } => {
                (1..=MAX_READ_REGISTERS).contains(&quantity)
            }
            _ => true,
        };
        if !quantity_ok {
            return Err(ExceptionCode::IllegalDataValue);
        }

        Ok(request)
    }
}

/// Response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Coils(Vec<bool>),
    DiscreteInputs(Vec<bool>),
    HoldingRegisters(Vec<u16>),
    InputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Response {
    /// Encode as PDU bytes (server side)
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PDU_LEN);
        match self {
            Self::Coils(bits) | Self::DiscreteInputs(bits) => {
                let code = if matches!(self, Self::Coils(_)) {
                    function::READ_COILS
                } else {
                    function::READ_DISCRETE_INPUTS
                };
                let packed = pack_bits(bits);
                buf.put_u8(code);
                // At most MAX_READ_BITS / 8 bytes
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            Self::HoldingRegisters(words) | Self::InputRegisters(words) => {
                let code = if matches!(self, Self::HoldingRegisters(_)) {
                    function::READ_HOLDING_REGISTERS
                } else {
                    function::READ_INPUT_REGISTERS
                };
                buf.put_u8(code);
                // At most MAX_READ_REGISTERS * 2 bytes
                buf.put_u8((words.len() * 2) as u8);
                for word in words {
                    buf.put_u16(*word);
                }
            }
            Self::WriteSingleCoil { address, value } => {
                buf.put_u8(function::WRITE_SINGLE_COIL);
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            }
            Self::WriteSingleRegister { address, value } => {
                buf.put_u8(function::WRITE_SINGLE_REGISTER);
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
        }
        buf.freeze()
    }

    /// Decode the device's answer to `request`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Exception`] for an exception response and
    /// [`ProtocolError::Malformed`] when the PDU does not answer `request`
    pub fn decode(request: &Request, pdu: &[u8]) -> Result<Self, ProtocolError> {
        let (&code, mut body) = pdu
            .split_first()
            .ok_or_else(|| ProtocolError::Malformed("empty response".to_string()))?;

        if code == request.function_code() | EXCEPTION_FLAG {
            let exception = body
                .first()
                .copied()
                .ok_or_else(|| ProtocolError::Malformed("exception without code".to_string()))?;
            return Err(ProtocolError::Exception {
                function: request.function_code(),
                code: ExceptionCode::from_u8(exception),
            });
        }
        if code != request.function_code() {
            return Err(ProtocolError::Malformed(format!(
                "function code {code:#04x} does not answer {:#04x}",
                request.function_code()
            )));
        }

        match *request {
            Request::ReadCoils { quantity, .. } | Request::ReadDiscreteInputs { quantity, .. } => {
                let byte_count = usize::from(*body.first().unwrap_or(&0));
                let expected = usize::from(quantity).div_ceil(8);
                if byte_count != expected || body.len() != byte_count + 1 {
                    return Err(ProtocolError::Malformed("bit response length".to_string()));
                }
                let bits = unpack_bits(&body[1..], usize::from(quantity));
                Ok(if matches!(request, Request::ReadCoils { .. }) {
                    Self::Coils(bits)
                } else {
                    Self::DiscreteInputs(bits)
                })
            }
            Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => {
                let byte_count = usize::from(*body.first().unwrap_or(&0));
                if byte_count != usize::from(quantity) * 2 || body.len() != byte_count + 1 {
                    return Err(ProtocolError::Malformed("register response length".to_string()));
                }
                body.advance(1);
                let words = (0..quantity).map(|_| body.get_u16()).collect();
                Ok(if matches!(request, Request::ReadHoldingRegisters { .. }) {
                    Self::HoldingRegisters(words)
                } else {
                    Self::InputRegisters(words)
                })
            }
            Request::WriteSingleCoil { .. } => {
                if body.len() != 4 {
                    return Err(ProtocolError::Malformed("write coil echo length".to_string()));
                }
                let address = body.get_u16();
                let value = match body.get_u16() {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "coil echo value {other:#06x}"
                        )));
                    }
                };
                Ok(Self::WriteSingleCoil { address, value })
            }
            Request::WriteSingleRegister { .. } => {
                if body.len() != 4 {
                    return Err(ProtocolError::Malformed(
                        "write register echo length".to_string(),
                    ));
                }
                Ok(Self::WriteSingleRegister {
                    address: body.get_u16(),
                    value: body.get_u16(),
                })
            }
        }
    }
}

/// Exception response PDU for `function`
#[must_use]
pub fn exception_pdu(function: u8, code: ExceptionCode) -> Bytes {
    Bytes::from(vec![function | EXCEPTION_FLAG, code.as_u8()])
}

/// One MBAP-framed ADU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
}

impl Frame {
    /// Encode header and PDU
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + self.pdu.len());
        buf.put_u16(self.transaction_id);
        buf.put_u16(0);
        // PDU is bounded by MAX_PDU_LEN
        buf.put_u16((self.pdu.len() + 1) as u16);
        buf.put_u8(self.unit_id);
        buf.put_slice(&self.pdu);
        buf.freeze()
    }
}

/// Read one frame
///
/// Returns `Ok(None)` on a clean EOF before any header byte.
///
/// # Errors
///
/// Returns `InvalidData` for a non-Modbus protocol id or impossible length,
/// `UnexpectedEof` when the peer closes mid-frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut fields = &header[..];
    let transaction_id = fields.get_u16();
    let protocol_id = fields.get_u16();
    let length = usize::from(fields.get_u16());
    let unit_id = fields.get_u8();

    if protocol_id != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected protocol id {protocol_id}"),
        ));
    }
    if !(2..=MAX_PDU_LEN + 1).contains(&length) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid MBAP length {length}"),
        ));
    }

    let mut pdu = vec![0u8; length - 1];
    reader.read_exact(&mut pdu).await?;

    Ok(Some(Frame {
        transaction_id,
        unit_id,
        pdu: Bytes::from(pdu),
    }))
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_write_coil_request() {
        let pdu = Request::WriteSingleCoil { address: 1, value: true }.encode();
        assert_eq!(&pdu[..], &[0x05, 0x00, 0x01, 0xFF, 0x00]);
    }

    #[test]
    fn encodes_frame_header() {
        let frame = Frame {
            transaction_id: 0x0102,
            unit_id: 0x11,
            pdu: Request::ReadHoldingRegisters { address: 1, quantity: 1 }.encode(),
        };
        assert_eq!(
            &frame.encode()[..],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn decodes_register_response() {
        let request = Request::ReadHoldingRegisters { address: 0, quantity: 2 };
        let response = Response::decode(&request, &[0x03, 0x04, 0x01, 0xC8, 0x00, 0x7B]).unwrap();
        assert_eq!(response, Response::HoldingRegisters(vec![456, 123]));
    }

    #[test]
    fn decodes_coil_bits_lsb_first() {
        let request = Request::ReadCoils { address: 0, quantity: 3 };
        let response = Response::decode(&request, &[0x01, 0x01, 0b0000_0101]).unwrap();
        assert_eq!(response, Response::Coils(vec![true, false, true]));
    }

    #[test]
    fn decodes_exception() {
        let request = Request::WriteSingleRegister { address: 500, value: 1 };
        let err = Response::decode(&request, &[0x86, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Exception {
                function: 0x06,
                code: ExceptionCode::IllegalDataAddress
            }
        ));
    }

    #[test]
    fn rejects_mismatched_function() {
        let request = Request::ReadCoils { address: 0, quantity: 1 };
        assert!(matches!(
            Response::decode(&request, &[0x03, 0x02, 0x00, 0x01]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn server_decode_rejects_bad_coil_value() {
        assert_eq!(
            Request::decode(&[0x05, 0x00, 0x01, 0x12, 0x34]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn server_decode_rejects_unknown_function() {
        assert_eq!(
            Request::decode(&[0x10, 0x00, 0x01, 0x00, 0x01]),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn server_decode_rejects_zero_quantity() {
        assert_eq!(
            Request::decode(&[0x03, 0x00, 0x01, 0x00, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn response_encoding_matches_client_decoding() {
        let request = Request::ReadCoils { address: 0, quantity: 10 };
        let bits = vec![true, false, false, true, false, false, false, false, true, true];
        let pdu = Response::Coils(bits.clone()).encode();
        assert_eq!(Response::decode(&request, &pdu).unwrap(), Response::Coils(bits));
    }

    #[tokio::test]
    async fn reads_frame_from_stream() {
        let frame = Frame {
            transaction_id: 7,
            unit_id: 0,
            pdu: Request::ReadCoils { address: 1, quantity: 1 }.encode(),
        };
        let bytes = frame.encode();
        let mut reader = &bytes[..];

        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(frame));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reassembles_frame_split_across_reads() {
        let frame = Frame {
            transaction_id: 0x0102,
            unit_id: 3,
            pdu: Request::WriteSingleRegister { address: 1, value: 456 }.encode(),
        };
        let bytes = frame.encode();
        let mut stream = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..9])
            .read(&bytes[9..])
            .build();

        assert_eq!(read_frame(&mut stream).await.unwrap(), Some(frame));
        assert_eq!(read_frame(&mut stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_foreign_protocol_id() {
        let bytes = [0x00, 0x01, 0x00, 0x05, 0x00, 0x02, 0x00, 0x01];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
