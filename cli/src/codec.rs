//! Demo object-exchange framing over an accepted session
//!
//! A deliberately small codec so the CLI can exercise the object-exchange
//! state machine over the TCP backend. Request frame: opcode, flags,
//! u16-LE name length + name, u32-LE body length + body. Response frame:
//! code, u32-LE body length + body. Real deployments supply their own
//! protocol collaborator behind [`ObexChannel`].

use async_trait::async_trait;
use blueport_core::{
    BackendError, ObexChannel, ObexRequest, ObexResponse, SecurityAttributes, SessionHandle,
};

const OP_PUT: u8 = 0x02;
const OP_GET: u8 = 0x03;
const OP_DELETE: u8 = 0x04;
const OP_CONNECT: u8 = 0x80;
const OP_DISCONNECT: u8 = 0x81;
const OP_SETPATH: u8 = 0x85;

const FLAG_BACKUP: u8 = 0x01;
const FLAG_CREATE: u8 = 0x02;

/// [`ObexChannel`] over any accepted stream session
pub struct FramedObexChannel {
    session: SessionHandle,
}

impl FramedObexChannel {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BackendError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.session.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(BackendError::Closed);
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_name(&mut self) -> Result<Option<String>, BackendError> {
        let mut len_bytes = [0u8; 2];
        self.read_exact(&mut len_bytes).await?;
        let len = u16::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            return Ok(None);
        }
        let mut name = vec![0u8; len];
        self.read_exact(&mut name).await?;
        String::from_utf8(name)
            .map(Some)
            .map_err(|_| BackendError::Io("Object name is not valid UTF-8".to_string()))
    }

    async fn read_body(&mut self) -> Result<Vec<u8>, BackendError> {
        let mut len_bytes = [0u8; 4];
        self.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        self.read_exact(&mut body).await?;
        Ok(body)
    }
}

#[async_trait]
impl ObexChannel for FramedObexChannel {
    async fn read_request(&mut self) -> Result<ObexRequest, BackendError> {
        let mut header = [0u8; 2];
        self.read_exact(&mut header).await?;
        let (opcode, flags) = (header[0], header[1]);
        let name = self.read_name().await?;
        let body = self.read_body().await?;

        match opcode {
            OP_CONNECT => Ok(ObexRequest::Connect),
            OP_DISCONNECT => Ok(ObexRequest::Disconnect),
            OP_GET => Ok(ObexRequest::Get { name }),
            OP_PUT => Ok(ObexRequest::Put { name, body }),
            OP_DELETE => Ok(ObexRequest::Delete { name }),
            OP_SETPATH => Ok(ObexRequest::SetPath {
                name,
                backup: flags & FLAG_BACKUP != 0,
                create: flags & FLAG_CREATE != 0,
            }),
            other => Err(BackendError::Io(format!("Unknown opcode 0x{:02x}", other))),
        }
    }

    async fn write_response(&mut self, response: ObexResponse) -> Result<(), BackendError> {
        let mut frame = Vec::with_capacity(5 + response.body.len());
        frame.push(response.code.value());
        frame.extend_from_slice(&(response.body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&response.body);
        self.session.write(&frame).await
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.session.close().await
    }

    fn security_attributes(&self) -> SecurityAttributes {
        self.session.security_attributes()
    }

    fn peer_address(&self) -> String {
        self.session.peer_address().to_string()
    }
}
