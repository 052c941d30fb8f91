//! File transfer in the control direction (104 client side).
//!
//! One session at a time walks through directory listing or
//! select / call file / call section / acknowledge, reassembling sections in
//! order. Any deviation aborts the whole session; nothing partial is
//! delivered.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{
    Asdu, AsduHeader, Cot, Cp56Time2a, InformationElement, InformationObject, Ioa, TypeId,
};

/// SOF bit: last file of the directory.
pub const SOF_LAST_FILE: u8 = 0x20;
/// FRQ/SRQ/AFQ bit 7: negative.
const NEGATIVE_BIT: u8 = 0x80;

/// SCQ values sent with F_SC_NA_1.
const SCQ_DIRECTORY: u8 = 0;
const SCQ_SELECT_FILE: u8 = 1;
const SCQ_CALL_FILE: u8 = 2;
const SCQ_CALL_SECTION: u8 = 6;

/// AFQ values sent with F_AF_NA_1.
const AFQ_FILE_OK: u8 = 1;
const AFQ_SECTION_OK: u8 = 3;

/// File transfer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileTransferError {
    /// A session is already running on this connection
    #[error("file transfer already in progress")]
    Busy,

    /// Section arrived out of order
    #[error("section {received} received, expected {expected}")]
    OutOfOrder { expected: u8, received: u8 },

    /// No progress within the transfer timeout
    #[error("file transfer stalled")]
    Stalled,

    /// Server refused
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Section or file checksum differs
    #[error("checksum mismatch: expected {expected:#04x}, computed {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Reassembled length differs from the announced length
    #[error("length {actual} differs from announced {expected}")]
    LengthMismatch { expected: u32, actual: u32 },

    /// Element names a file other than the one being transferred
    #[error("file {received} received, expected {expected}")]
    WrongFile { expected: u16, received: u16 },

    /// Element not allowed in the current step of the handshake
    #[error("unexpected {received} while {stage}")]
    Unexpected { stage: &'static str, received: TypeId },

    /// Aborted by disconnect or connection loss
    #[error("file transfer cancelled")]
    Cancelled,

    /// No file name given and no directory listed yet
    #[error("no file listed")]
    NoFileListed,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Name of file (NOF)
    pub name: u16,
    /// Information object address of the file
    pub ioa: u32,
    /// Length of file (LOF)
    pub length: u32,
    /// Status of file (SOF)
    pub status: u8,
    /// Creation time
    pub time: Cp56Time2a,
}

/// Which file to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileRequest {
    /// File IOA; ignored when `name` is `None`
    pub ioa: u32,
    /// File name, first listed file if `None`
    pub name: Option<u16>,
    /// Station address, connection default if `None`
    pub common_address: Option<u16>,
}

impl FileRequest {
    /// A specific file.
    pub fn new(ioa: u32, name: u16) -> Self {
        Self {
            ioa,
            name: Some(name),
            common_address: None,
        }
    }

    /// The first file of the last directory listing.
    pub fn first_listed() -> Self {
        Self::default()
    }

    /// Set the station address.
    pub fn station(mut self, address: u16) -> Self {
        self.common_address = Some(address);
        self
    }
}

/// Results of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum FileTransferEvent {
    /// Directory complete
    ListReceived(Vec<FileEntry>),
    /// File complete
    FileReceived { name: u16, ioa: u32, bytes: Bytes },
    /// Session aborted
    Failed { name: u16, error: FileTransferError },
}

#[derive(Debug)]
enum Stage {
    Directory(Vec<FileEntry>),
    SelectFile,
    CallFile,
    Section { buffer: BytesMut, length: u32 },
    SectionDone,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Directory(_) => "listing directory",
            Self::SelectFile => "selecting file",
            Self::CallFile => "calling file",
            Self::Section { .. } => "receiving section",
            Self::SectionDone => "waiting for next section",
        }
    }
}

/// NOF carried by the element, `None` for directory entries and non-file types.
fn file_name(element: &InformationElement) -> Option<u16> {
    match element {
        InformationElement::FileReady { file, .. }
        | InformationElement::SectionReady { file, .. }
        | InformationElement::CallFile { file, .. }
        | InformationElement::LastSection { file, .. }
        | InformationElement::AckFile { file, .. }
        | InformationElement::Segment { file, .. } => Some(*file),
        _ => None,
    }
}

#[derive(Debug)]
struct Session {
    common_address: u16,
    ioa: u32,
    name: u16,
    length: u32,
    /// Section being received or expected next
    section: u8,
    data: BytesMut,
    stage: Stage,
    deadline: Instant,
}

enum Step {
    Continue(Session),
    Done(FileTransferEvent),
    Abort(u16, FileTransferError),
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// File transfer state machine for one connection.
#[derive(Debug)]
pub struct FileTransfer {
    timeout: Duration,
    originator: u8,
    common_address: u16,
    session: Option<Session>,
    listing: Vec<FileEntry>,
    outbox: VecDeque<Asdu>,
    events: VecDeque<FileTransferEvent>,
}

impl FileTransfer {
    /// Create an idle file transfer machine.
    pub fn new(timeout: Duration, originator: u8, common_address: u16) -> Self {
        Self {
            timeout,
            originator,
            common_address,
            session: None,
            listing: Vec::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Check whether a session is running.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Last complete directory listing.
    pub fn listing(&self) -> &[FileEntry] {
        &self.listing
    }

    /// Ask the server for its directory.
    pub fn request_directory(
        &mut self,
        common_address: Option<u16>,
        now: Instant,
    ) -> Result<(), FileTransferError> {
        if self.session.is_some() {
            return Err(FileTransferError::Busy);
        }
        let common_address = common_address.unwrap_or(self.common_address);
        let request = self.call(common_address, Cot::Request, 0, 0, 0, SCQ_DIRECTORY);
        self.outbox.push_back(request);
        self.session = Some(Session {
            common_address,
            ioa: 0,
            name: 0,
            length: 0,
            section: 0,
            data: BytesMut::new(),
            stage: Stage::Directory(Vec::new()),
            deadline: now + self.timeout,
        });
        Ok(())
    }

    /// Start downloading a file.
    pub fn request_file(
        &mut self,
        request: FileRequest,
        now: Instant,
    ) -> Result<(), FileTransferError> {
        if self.session.is_some() {
            return Err(FileTransferError::Busy);
        }
        let (ioa, name) = match request.name {
            Some(name) => (request.ioa, name),
            None => self
                .listing
                .first()
                .map(|entry| (entry.ioa, entry.name))
                .ok_or(FileTransferError::NoFileListed)?,
        };
        let common_address = request.common_address.unwrap_or(self.common_address);

        debug!(name, ioa, "Selecting file");
        let select = self.call(common_address, Cot::FileTransfer, ioa, name, 0, SCQ_SELECT_FILE);
        self.outbox.push_back(select);
        self.session = Some(Session {
            common_address,
            ioa,
            name,
            length: 0,
            section: 1,
            data: BytesMut::new(),
            stage: Stage::SelectFile,
            deadline: now + self.timeout,
        });
        Ok(())
    }

    /// Offer a received ASDU. Returns `true` when the session consumed it.
    pub fn on_asdu(&mut self, asdu: &Asdu, now: Instant) -> bool {
        if !asdu.type_id().is_file_transfer() {
            return false;
        }
        let Some(session) = self.session.take() else {
            debug!(type_id = %asdu.type_id(), "File transfer ASDU without session");
            return false;
        };

        match self.advance(session, asdu, now) {
            Step::Continue(session) => self.session = Some(session),
            Step::Done(event) => self.events.push_back(event),
            Step::Abort(name, error) => {
                warn!(name, "File transfer aborted: {}", error);
                self.events
                    .push_back(FileTransferEvent::Failed { name, error });
            }
        }
        true
    }

    fn advance(&mut self, mut session: Session, asdu: &Asdu, now: Instant) -> Step {
        let name = session.name;
        for object in &asdu.objects {
            if !matches!(session.stage, Stage::Directory(_)) {
                if let Some(received) = file_name(&object.element) {
                    if received != name {
                        return Step::Abort(
                            name,
                            FileTransferError::WrongFile {
                                expected: name,
                                received,
                            },
                        );
                    }
                }
            }

            let stage = std::mem::replace(&mut session.stage, Stage::SectionDone);
            session.stage = match (stage, &object.element) {
                (
                    Stage::Directory(mut entries),
                    InformationElement::Directory {
                        file,
                        length,
                        status,
                        time,
                    },
                ) => {
                    entries.push(FileEntry {
                        name: *file,
                        ioa: object.ioa.value(),
                        length: *length,
                        status: *status,
                        time: *time,
                    });
                    if status & SOF_LAST_FILE != 0 {
                        self.listing = entries.clone();
                        return Step::Done(FileTransferEvent::ListReceived(entries));
                    }
                    Stage::Directory(entries)
                }

                (
                    Stage::SelectFile,
                    InformationElement::FileReady {
                        length, qualifier, ..
                    },
                ) => {
                    if qualifier & NEGATIVE_BIT != 0 {
                        return Step::Abort(
                            name,
                            FileTransferError::Rejected(format!("file {} not ready", name)),
                        );
                    }
                    session.length = *length;
                    self.send_call(&session, 0, SCQ_CALL_FILE);
                    Stage::CallFile
                }

                (
                    Stage::CallFile | Stage::SectionDone,
                    InformationElement::SectionReady {
                        section,
                        length,
                        qualifier,
                        ..
                    },
                ) => {
                    if qualifier & NEGATIVE_BIT != 0 {
                        return Step::Abort(
                            name,
                            FileTransferError::Rejected(format!("section {} not ready", section)),
                        );
                    }
                    if *section != session.section {
                        return Step::Abort(
                            name,
                            FileTransferError::OutOfOrder {
                                expected: session.section,
                                received: *section,
                            },
                        );
                    }
                    self.send_call(&session, *section, SCQ_CALL_SECTION);
                    Stage::Section {
                        buffer: BytesMut::new(),
                        length: *length,
                    }
                }

                (
                    Stage::Section { mut buffer, length },
                    InformationElement::Segment { section, data, .. },
                ) => {
                    if *section != session.section {
                        return Step::Abort(
                            name,
                            FileTransferError::OutOfOrder {
                                expected: session.section,
                                received: *section,
                            },
                        );
                    }
                    buffer.extend_from_slice(data);
                    Stage::Section { buffer, length }
                }

                (
                    Stage::Section { buffer, length },
                    InformationElement::LastSection {
                        section,
                        qualifier: 3 | 4,
                        checksum: expected,
                        ..
                    },
                ) => {
                    if *section != session.section {
                        return Step::Abort(
                            name,
                            FileTransferError::OutOfOrder {
                                expected: session.section,
                                received: *section,
                            },
                        );
                    }
                    if buffer.len() as u32 != length {
                        return Step::Abort(
                            name,
                            FileTransferError::LengthMismatch {
                                expected: length,
                                actual: buffer.len() as u32,
                            },
                        );
                    }
                    let actual = checksum(&buffer);
                    if actual != *expected {
                        return Step::Abort(
                            name,
                            FileTransferError::ChecksumMismatch {
                                expected: *expected,
                                actual,
                            },
                        );
                    }
                    session.data.extend_from_slice(&buffer);
                    self.send_ack(&session, *section, AFQ_SECTION_OK);
                    session.section = session.section.wrapping_add(1);
                    Stage::SectionDone
                }

                (
                    Stage::SectionDone,
                    InformationElement::LastSection {
                        qualifier: 1 | 2,
                        checksum: expected,
                        ..
                    },
                ) => {
                    let actual_len = session.data.len() as u32;
                    if actual_len != session.length {
                        return Step::Abort(
                            name,
                            FileTransferError::LengthMismatch {
                                expected: session.length,
                                actual: actual_len,
                            },
                        );
                    }
                    let actual = checksum(&session.data);
                    if actual != *expected {
                        return Step::Abort(
                            name,
                            FileTransferError::ChecksumMismatch {
                                expected: *expected,
                                actual,
                            },
                        );
                    }
                    self.send_ack(&session, 0, AFQ_FILE_OK);
                    debug!(name, length = actual_len, "File received");
                    return Step::Done(FileTransferEvent::FileReceived {
                        name,
                        ioa: session.ioa,
                        bytes: std::mem::take(&mut session.data).freeze(),
                    });
                }

                (stage, _) => {
                    return Step::Abort(
                        name,
                        FileTransferError::Unexpected {
                            stage: stage.name(),
                            received: asdu.type_id(),
                        },
                    );
                }
            };
        }

        session.deadline = now + self.timeout;
        Step::Continue(session)
    }

    /// Abort a stalled session.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.session.as_ref().is_some_and(|s| now >= s.deadline) {
            self.abort(FileTransferError::Stalled);
        }
    }

    /// Abort the running session, if any, as cancelled.
    pub fn cancel(&mut self) {
        self.abort(FileTransferError::Cancelled);
    }

    fn abort(&mut self, error: FileTransferError) {
        if let Some(session) = self.session.take() {
            warn!(name = session.name, "File transfer aborted: {}", error);
            self.events.push_back(FileTransferEvent::Failed {
                name: session.name,
                error,
            });
        }
    }

    /// Stall deadline of the running session.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.deadline)
    }

    /// Next ASDU to send.
    pub fn poll_transmit(&mut self) -> Option<Asdu> {
        self.outbox.pop_front()
    }

    /// Next session result.
    pub fn poll_event(&mut self) -> Option<FileTransferEvent> {
        self.events.pop_front()
    }

    fn send_call(&mut self, session: &Session, section: u8, qualifier: u8) {
        let asdu = self.call(
            session.common_address,
            Cot::FileTransfer,
            session.ioa,
            session.name,
            section,
            qualifier,
        );
        self.outbox.push_back(asdu);
    }

    fn send_ack(&mut self, session: &Session, section: u8, qualifier: u8) {
        let header = AsduHeader::new(TypeId::AckFile, Cot::FileTransfer, session.common_address)
            .with_originator(self.originator);
        self.outbox.push_back(Asdu::single(
            header,
            InformationObject::new(
                Ioa(session.ioa),
                InformationElement::AckFile {
                    file: session.name,
                    section,
                    qualifier,
                },
            ),
        ));
    }

    fn call(
        &self,
        common_address: u16,
        cot: Cot,
        ioa: u32,
        file: u16,
        section: u8,
        qualifier: u8,
    ) -> Asdu {
        let header =
            AsduHeader::new(TypeId::CallFile, cot, common_address).with_originator(self.originator);
        Asdu::single(
            header,
            InformationObject::new(
                Ioa(ioa),
                InformationElement::CallFile {
                    file,
                    section,
                    qualifier,
                },
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IOA: u32 = 0x0501;
    const NAME: u16 = 7;

    fn server(type_id: TypeId, element: InformationElement) -> Asdu {
        Asdu::single(
            AsduHeader::new(type_id, Cot::FileTransfer, 1),
            InformationObject::new(Ioa(IOA), element),
        )
    }

    fn file_ready(length: u32, qualifier: u8) -> Asdu {
        server(
            TypeId::FileReady,
            InformationElement::FileReady {
                file: NAME,
                length,
                qualifier,
            },
        )
    }

    fn section_ready(section: u8) -> Asdu {
        server(
            TypeId::SectionReady,
            InformationElement::SectionReady {
                file: NAME,
                section,
                length: 3,
                qualifier: 0,
            },
        )
    }

    fn segment(section: u8, data: &'static [u8]) -> Asdu {
        server(
            TypeId::Segment,
            InformationElement::Segment {
                file: NAME,
                section,
                data: Bytes::from_static(data),
            },
        )
    }

    fn last(section: u8, qualifier: u8, checksum: u8) -> Asdu {
        server(
            TypeId::LastSection,
            InformationElement::LastSection {
                file: NAME,
                section,
                qualifier,
                checksum,
            },
        )
    }

    fn sent(transfer: &mut FileTransfer) -> Vec<InformationElement> {
        std::iter::from_fn(|| transfer.poll_transmit())
            .map(|asdu| asdu.objects[0].element.clone())
            .collect()
    }

    fn call(section: u8, qualifier: u8) -> InformationElement {
        InformationElement::CallFile {
            file: NAME,
            section,
            qualifier,
        }
    }

    fn ack(section: u8, qualifier: u8) -> InformationElement {
        InformationElement::AckFile {
            file: NAME,
            section,
            qualifier,
        }
    }

    fn transfer() -> FileTransfer {
        FileTransfer::new(Duration::from_secs(30), 0, 1)
    }

    #[test]
    fn test_directory_listing() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer.request_directory(None, now).unwrap();

        let request = transfer.poll_transmit().unwrap();
        assert_eq!(request.header.cot, Cot::Request);
        assert_eq!(request.objects[0].ioa, Ioa(0));
        assert_eq!(
            request.objects[0].element,
            InformationElement::CallFile {
                file: 0,
                section: 0,
                qualifier: 0
            }
        );

        let mut listing = Asdu::new(AsduHeader::new(TypeId::Directory, Cot::Request, 1));
        for (ioa, file, status) in [(0x0501, 7, 0x00), (0x0502, 8, SOF_LAST_FILE)] {
            listing.push(InformationObject::new(
                Ioa(ioa),
                InformationElement::Directory {
                    file,
                    length: 100,
                    status,
                    time: Cp56Time2a::default(),
                },
            ));
        }
        assert!(transfer.on_asdu(&listing, now));

        let Some(FileTransferEvent::ListReceived(files)) = transfer.poll_event() else {
            panic!("expected a listing");
        };
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].name, 8);
        assert_eq!(files[1].ioa, 0x0502);
        assert!(!transfer.is_active());
        assert_eq!(transfer.listing().len(), 2);
    }

    #[test]
    fn test_full_download() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        assert_eq!(sent(&mut transfer), vec![call(0, 1)]);

        transfer.on_asdu(&file_ready(6, 0), now);
        assert_eq!(sent(&mut transfer), vec![call(0, 2)]);

        transfer.on_asdu(&section_ready(1), now);
        assert_eq!(sent(&mut transfer), vec![call(1, 6)]);
        transfer.on_asdu(&segment(1, &[1, 2]), now);
        transfer.on_asdu(&segment(1, &[3]), now);
        transfer.on_asdu(&last(1, 3, 6), now);
        assert_eq!(sent(&mut transfer), vec![ack(1, 3)]);

        transfer.on_asdu(&section_ready(2), now);
        assert_eq!(sent(&mut transfer), vec![call(2, 6)]);
        transfer.on_asdu(&segment(2, &[4, 5, 6]), now);
        transfer.on_asdu(&last(2, 3, 15), now);
        assert_eq!(sent(&mut transfer), vec![ack(2, 3)]);

        transfer.on_asdu(&last(2, 1, 21), now);
        assert_eq!(sent(&mut transfer), vec![ack(0, 1)]);
        assert_eq!(
            transfer.poll_event(),
            Some(FileTransferEvent::FileReceived {
                name: NAME,
                ioa: IOA,
                bytes: Bytes::from_static(&[1, 2, 3, 4, 5, 6]),
            })
        );
        assert!(!transfer.is_active());
    }

    #[test]
    fn test_out_of_order_section_aborts() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.on_asdu(&file_ready(9, 0), now);

        // server offers sections 2, 1, 3
        transfer.on_asdu(&section_ready(2), now);
        assert_eq!(
            transfer.poll_event(),
            Some(FileTransferEvent::Failed {
                name: NAME,
                error: FileTransferError::OutOfOrder {
                    expected: 1,
                    received: 2
                }
            })
        );
        assert!(!transfer.is_active());

        // the rest is not consumed and nothing partial is delivered
        assert!(!transfer.on_asdu(&section_ready(1), now));
        assert!(transfer.poll_event().is_none());
    }

    fn receiving_section_one(now: Instant) -> FileTransfer {
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.on_asdu(&file_ready(6, 0), now);
        transfer.on_asdu(&section_ready(1), now);
        sent(&mut transfer);
        transfer
    }

    fn failure(transfer: &mut FileTransfer) -> FileTransferError {
        match transfer.poll_event() {
            Some(FileTransferEvent::Failed { name, error }) => {
                assert_eq!(name, NAME);
                assert!(!transfer.is_active());
                error
            }
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    #[test]
    fn test_segment_after_section_end_aborts() {
        let now = Instant::now();
        let mut transfer = receiving_section_one(now);
        transfer.on_asdu(&segment(1, &[1, 2, 3]), now);
        transfer.on_asdu(&last(1, 3, 6), now);
        assert_eq!(sent(&mut transfer), vec![ack(1, 3)]);

        assert!(transfer.on_asdu(&segment(1, &[4]), now));
        assert_eq!(
            failure(&mut transfer),
            FileTransferError::Unexpected {
                stage: "waiting for next section",
                received: TypeId::Segment
            }
        );
        assert!(sent(&mut transfer).is_empty());
    }

    #[test]
    fn test_file_end_inside_section_aborts() {
        let now = Instant::now();
        let mut transfer = receiving_section_one(now);
        transfer.on_asdu(&segment(1, &[1, 2]), now);
        transfer.on_asdu(&last(1, 1, 3), now);
        assert_eq!(
            failure(&mut transfer),
            FileTransferError::Unexpected {
                stage: "receiving section",
                received: TypeId::LastSection
            }
        );
    }

    #[test]
    fn test_repeated_section_ready_aborts() {
        let now = Instant::now();
        let mut transfer = receiving_section_one(now);
        transfer.on_asdu(&section_ready(1), now);
        assert_eq!(
            failure(&mut transfer),
            FileTransferError::Unexpected {
                stage: "receiving section",
                received: TypeId::SectionReady
            }
        );
        assert!(sent(&mut transfer).is_empty());
    }

    #[test]
    fn test_section_end_before_file_ready_aborts() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.on_asdu(&last(1, 3, 0), now);
        assert_eq!(
            failure(&mut transfer),
            FileTransferError::Unexpected {
                stage: "selecting file",
                received: TypeId::LastSection
            }
        );
    }

    #[test]
    fn test_foreign_file_name_aborts() {
        let now = Instant::now();
        let mut transfer = receiving_section_one(now);
        let foreign = server(
            TypeId::Segment,
            InformationElement::Segment {
                file: NAME + 1,
                section: 1,
                data: Bytes::from_static(&[1]),
            },
        );
        transfer.on_asdu(&foreign, now);
        assert_eq!(
            failure(&mut transfer),
            FileTransferError::WrongFile {
                expected: NAME,
                received: NAME + 1
            }
        );
    }

    #[test]
    fn test_section_length_checked() {
        let now = Instant::now();
        let mut transfer = receiving_section_one(now);
        // section ready announced 3 bytes
        transfer.on_asdu(&segment(1, &[1, 2]), now);
        transfer.on_asdu(&last(1, 3, 3), now);
        assert_eq!(
            failure(&mut transfer),
            FileTransferError::LengthMismatch {
                expected: 3,
                actual: 2
            }
        );
        assert!(sent(&mut transfer).is_empty());
    }

    #[test]
    fn test_checksum_mismatch_aborts() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.on_asdu(&file_ready(3, 0), now);
        transfer.on_asdu(&section_ready(1), now);
        transfer.on_asdu(&segment(1, &[1, 2, 3]), now);
        transfer.on_asdu(&last(1, 3, 7), now);

        assert_eq!(
            transfer.poll_event(),
            Some(FileTransferEvent::Failed {
                name: NAME,
                error: FileTransferError::ChecksumMismatch {
                    expected: 7,
                    actual: 6
                }
            })
        );
    }

    #[test]
    fn test_length_mismatch_aborts() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.on_asdu(&file_ready(10, 0), now);
        transfer.on_asdu(&section_ready(1), now);
        transfer.on_asdu(&segment(1, &[1, 2, 3]), now);
        transfer.on_asdu(&last(1, 3, 6), now);
        transfer.on_asdu(&last(1, 1, 6), now);

        assert!(matches!(
            transfer.poll_event(),
            Some(FileTransferEvent::Failed {
                error: FileTransferError::LengthMismatch {
                    expected: 10,
                    actual: 3
                },
                ..
            })
        ));
    }

    #[test]
    fn test_negative_file_ready_rejected() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.on_asdu(&file_ready(0, 0x80), now);

        assert!(matches!(
            transfer.poll_event(),
            Some(FileTransferEvent::Failed {
                error: FileTransferError::Rejected(_),
                ..
            })
        ));
    }

    #[test]
    fn test_busy_and_no_file_listed() {
        let now = Instant::now();
        let mut transfer = transfer();
        assert_eq!(
            transfer.request_file(FileRequest::first_listed(), now),
            Err(FileTransferError::NoFileListed)
        );

        transfer.request_directory(None, now).unwrap();
        assert_eq!(
            transfer.request_directory(None, now),
            Err(FileTransferError::Busy)
        );
        assert_eq!(
            transfer.request_file(FileRequest::new(IOA, NAME), now),
            Err(FileTransferError::Busy)
        );
    }

    #[test]
    fn test_stall_timeout() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        let later = now + Duration::from_secs(20);
        transfer.on_asdu(&file_ready(3, 0), later);
        assert_eq!(
            transfer.next_deadline(),
            Some(later + Duration::from_secs(30))
        );

        transfer.poll_timers(now + Duration::from_secs(30));
        assert!(transfer.is_active());
        transfer.poll_timers(later + Duration::from_secs(30));
        assert_eq!(
            transfer.poll_event(),
            Some(FileTransferEvent::Failed {
                name: NAME,
                error: FileTransferError::Stalled
            })
        );
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer.cancel();
        assert!(transfer.poll_event().is_none());

        transfer
            .request_file(FileRequest::new(IOA, NAME), now)
            .unwrap();
        transfer.cancel();
        assert_eq!(
            transfer.poll_event(),
            Some(FileTransferEvent::Failed {
                name: NAME,
                error: FileTransferError::Cancelled
            })
        );
    }

    #[test]
    fn test_non_file_asdu_ignored() {
        let now = Instant::now();
        let mut transfer = transfer();
        transfer.request_directory(None, now).unwrap();
        let asdu = Asdu::single(
            AsduHeader::new(TypeId::InterrogationCommand, Cot::ActivationConfirm, 1),
            InformationObject::new(Ioa(0), InformationElement::Interrogation { qualifier: 20 }),
        );
        assert!(!transfer.on_asdu(&asdu, now));
        assert!(transfer.is_active());
    }
}
