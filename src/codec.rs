//! IEC 60870-5-104 codec for tokio.
//!
//! This module provides a codec implementation for framing IEC 104 APDUs
//! using the tokio-util codec framework. The ASDU of an I-frame is handed
//! over as raw bytes; decoding it is left to the caller so that an unknown
//! type identification does not tear down the framed stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::Iec60870Error;
use crate::types::{
    Apci, UFunction, MAX_APDU_LENGTH, MAX_ASDU_LENGTH, MIN_APDU_LENGTH, START_BYTE,
};

/// An IEC 104 APDU (Application Protocol Data Unit).
///
/// Contains the APCI header and, for I-frames, the raw ASDU bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Apdu {
    /// APCI (Application Protocol Control Information)
    pub apci: Apci,
    /// Encoded ASDU - only present in I-frames
    pub asdu: Option<Bytes>,
}

impl Apdu {
    /// Create a new I-frame APDU with an encoded ASDU.
    pub fn i_frame(send_seq: u16, recv_seq: u16, asdu: Bytes) -> Self {
        Self {
            apci: Apci::i_frame(send_seq, recv_seq),
            asdu: Some(asdu),
        }
    }

    /// Create a new S-frame APDU.
    pub fn s_frame(recv_seq: u16) -> Self {
        Self {
            apci: Apci::s_frame(recv_seq),
            asdu: None,
        }
    }

    /// Create a new U-frame APDU.
    pub fn u_frame(function: UFunction) -> Self {
        Self {
            apci: Apci::u_frame(function),
            asdu: None,
        }
    }

    /// Check if this is an I-frame.
    pub fn is_i_frame(&self) -> bool {
        self.apci.is_i_frame()
    }

    /// Check if this is an S-frame.
    pub fn is_s_frame(&self) -> bool {
        self.apci.is_s_frame()
    }

    /// Check if this is a U-frame.
    pub fn is_u_frame(&self) -> bool {
        self.apci.is_u_frame()
    }
}

impl std::fmt::Display for Apdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.apci)?;
        if let Some(asdu) = &self.asdu {
            write!(f, " [{} bytes]", asdu.len())?;
        }
        Ok(())
    }
}

/// IEC 60870-5-104 codec.
///
/// # Example
///
/// ```rust,ignore
/// use futures::{SinkExt, StreamExt};
/// use tokio_util::codec::Framed;
/// use voltage_iec60870::codec::{Apdu, Iec104Codec};
///
/// let stream = TcpStream::connect("192.168.1.100:2404").await?;
/// let mut framed = Framed::new(stream, Iec104Codec::new());
///
/// framed.send(Apdu::u_frame(UFunction::StartDtAct)).await?;
/// while let Some(apdu) = framed.next().await {
///     println!("Received: {}", apdu?);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Iec104Codec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    #[default]
    Start,
    Body {
        length: usize,
    },
}

impl Iec104Codec {
    /// Create a new IEC 104 codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Iec104Codec {
    type Item = Apdu;
    type Error = Iec60870Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Start => {
                    // Skip bytes until we find the start byte
                    let skip = src
                        .iter()
                        .position(|b| *b == START_BYTE)
                        .unwrap_or(src.len());
                    if skip > 0 {
                        trace!(skipped = skip, "Discarding bytes before start byte");
                        src.advance(skip);
                    }

                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let length = src[1] as usize;
                    if !(MIN_APDU_LENGTH..=MAX_APDU_LENGTH).contains(&length) {
                        src.advance(2);
                        return Err(Iec60870Error::invalid_frame(format!(
                            "APDU length {} outside {}..={}",
                            length, MIN_APDU_LENGTH, MAX_APDU_LENGTH
                        )));
                    }

                    self.state = DecodeState::Body { length };
                }

                DecodeState::Body { length } => {
                    let total_length = 2 + length;
                    if src.len() < total_length {
                        src.reserve(total_length - src.len());
                        return Ok(None);
                    }

                    let mut frame = src.split_to(total_length);
                    self.state = DecodeState::Start;

                    // [0x68] [length] [control x4] [ASDU...]
                    frame.advance(2);
                    let apci = Apci::parse(&frame[..4])?;
                    frame.advance(4);

                    let asdu = match (&apci, frame.is_empty()) {
                        (Apci::IFrame { .. }, false) => Some(frame.freeze()),
                        (Apci::IFrame { .. }, true) => {
                            return Err(Iec60870Error::invalid_frame("I-frame without ASDU"));
                        }
                        (_, true) => None,
                        (_, false) => {
                            return Err(Iec60870Error::invalid_frame(format!(
                                "{} carries {} unexpected bytes",
                                apci,
                                frame.len()
                            )));
                        }
                    };

                    return Ok(Some(Apdu { apci, asdu }));
                }
            }
        }
    }
}

impl Encoder<Apdu> for Iec104Codec {
    type Error = Iec60870Error;

    fn encode(&mut self, item: Apdu, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let asdu_len = item.asdu.as_ref().map(|a| a.len()).unwrap_or(0);
        if asdu_len > MAX_ASDU_LENGTH {
            return Err(Iec60870Error::Codec(format!(
                "ASDU of {} bytes exceeds {}",
                asdu_len, MAX_ASDU_LENGTH
            )));
        }

        dst.reserve(6 + asdu_len);
        dst.extend_from_slice(&item.apci.encode_header(asdu_len));
        if let Some(asdu) = &item.asdu {
            dst.extend_from_slice(asdu);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_u_frame() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00][..]);

        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(apdu.apci, Apci::u_frame(UFunction::StartDtAct));
        assert!(apdu.asdu.is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_s_frame() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(&[0x68, 0x04, 0x01, 0x00, 0xC8, 0x00][..]);

        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert!(apdu.is_s_frame());
        assert_eq!(apdu.apci.recv_seq(), Some(100));
    }

    #[test]
    fn test_decode_i_frame_keeps_asdu_bytes() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(
            &[
                0x68, 0x0E, 0x02, 0x00, 0x04, 0x00, // I(S=1, R=2)
                0x01, 0x01, 0x03, 0x00, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x01,
            ][..],
        );

        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(apdu.apci, Apci::i_frame(1, 2));
        assert_eq!(
            apdu.asdu.unwrap().as_ref(),
            &[0x01, 0x01, 0x03, 0x00, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_encode_frames() {
        let mut codec = Iec104Codec::new();

        let mut buf = BytesMut::new();
        codec.encode(Apdu::u_frame(UFunction::StartDtAct), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]);

        let mut buf = BytesMut::new();
        codec.encode(Apdu::s_frame(100), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x68, 0x04, 0x01, 0x00, 0xC8, 0x00]);

        let mut buf = BytesMut::new();
        let asdu = Bytes::from_static(&[0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0, 0, 0, 0x14]);
        codec.encode(Apdu::i_frame(10, 5, asdu), &mut buf).unwrap();
        assert_eq!(buf[0], START_BYTE);
        assert_eq!(buf[1], 14);
        assert_eq!(&buf[2..6], &[0x14, 0x00, 0x0A, 0x00]);
    }

    #[test]
    fn test_encode_oversized_asdu() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::new();
        let asdu = Bytes::from(vec![0u8; MAX_ASDU_LENGTH + 1]);
        assert!(codec.encode(Apdu::i_frame(0, 0, asdu), &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = Iec104Codec::new();

        let mut buf = BytesMut::from(&[0x68, 0x04][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x07, 0x00, 0x00, 0x00]);
        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert!(apdu.is_u_frame());
    }

    #[test]
    fn test_decode_skip_garbage() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(&[0xFF, 0xAA, 0x68, 0x04, 0x07, 0x00, 0x00, 0x00][..]);

        let apdu = codec.decode(&mut buf).unwrap().unwrap();
        assert!(apdu.is_u_frame());
    }

    #[test]
    fn test_decode_invalid_length() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(&[0x68, 0x02, 0x07, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Iec60870Error::InvalidFrame(_))
        ));

        let mut buf = BytesMut::from(&[0x68, 0xFE][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_unknown_u_function() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(&[0x68, 0x04, 0x33, 0x00, 0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_i_frame_without_asdu() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::from(&[0x68, 0x04, 0x00, 0x00, 0x00, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_sequence_of_frames() {
        let mut codec = Iec104Codec::new();
        let mut buf = BytesMut::new();
        for func in [UFunction::TestFrAct, UFunction::TestFrCon] {
            codec.encode(Apdu::u_frame(func), &mut buf).unwrap();
        }
        codec.encode(Apdu::s_frame(32767), &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().apci,
            Apci::u_frame(UFunction::TestFrAct)
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().apci,
            Apci::u_frame(UFunction::TestFrCon)
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().apci,
            Apci::s_frame(32767)
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
