use crate::messages::{BackendMessage, ErrorFields, TransactionState};
use crate::wire::{frame, put_cstring, put_value, Payload, MAX_MESSAGE_LEN};
use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use pgshard_core::Column;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub fn encode_message(msg: &BackendMessage, buf: &mut BytesMut) {
    let mut payload = BytesMut::new();
    match msg {
        BackendMessage::AuthenticationOk => payload.put_i32(0),
        BackendMessage::AuthenticationCleartextPassword => payload.put_i32(3),
        BackendMessage::AuthenticationMd5Password { salt } => {
            payload.put_i32(5);
            payload.extend_from_slice(salt);
        }
        BackendMessage::AuthenticationOther { code } => payload.put_i32(*code),
        BackendMessage::ParameterStatus { key, value } => {
            put_cstring(&mut payload, key);
            put_cstring(&mut payload, value);
        }
        BackendMessage::BackendKeyData { pid, secret } => {
            payload.put_i32(*pid);
            payload.put_i32(*secret);
        }
        BackendMessage::ReadyForQuery { state } => payload.put_u8(state.wire_byte()),
        BackendMessage::ParseComplete
        | BackendMessage::BindComplete
        | BackendMessage::CloseComplete
        | BackendMessage::NoData
        | BackendMessage::PortalSuspended
        | BackendMessage::EmptyQueryResponse
        | BackendMessage::CopyDone => {}
        BackendMessage::ParameterDescription { oids } => {
            payload.put_i16(oids.len() as i16);
            for oid in oids {
                payload.put_i32(*oid);
            }
        }
        BackendMessage::RowDescription { fields } => {
            payload.put_i16(fields.len() as i16);
            for field in fields {
                put_cstring(&mut payload, &field.name);
                payload.put_i32(field.table_oid);
                payload.put_i16(field.column_id);
                payload.put_i32(field.type_oid);
                payload.put_i16(field.type_size);
                payload.put_i32(field.type_modifier);
                payload.put_i16(field.format);
            }
        }
        BackendMessage::DataRow { values } => {
            payload.put_i16(values.len() as i16);
            for value in values {
                put_value(&mut payload, value);
            }
        }
        BackendMessage::CommandComplete { tag } => put_cstring(&mut payload, tag),
        BackendMessage::ErrorResponse { fields } | BackendMessage::NoticeResponse { fields } => {
            put_error_fields(&mut payload, fields)
        }
        BackendMessage::CopyInResponse { format, columns }
        | BackendMessage::CopyOutResponse { format, columns } => {
            payload.put_i8(*format);
            payload.put_i16(columns.len() as i16);
            for column in columns {
                payload.put_i16(*column);
            }
        }
        BackendMessage::CopyData { data } => payload.extend_from_slice(data),
        BackendMessage::NotificationResponse {
            pid,
            channel,
            payload: body,
        } => {
            payload.put_i32(*pid);
            put_cstring(&mut payload, channel);
            put_cstring(&mut payload, body);
        }
    }
    frame(buf, msg.code(), &payload);
}

fn put_error_fields(buf: &mut BytesMut, fields: &ErrorFields) {
    buf.put_u8(b'S');
    put_cstring(buf, &fields.severity);
    buf.put_u8(b'V');
    put_cstring(buf, &fields.severity);
    buf.put_u8(b'C');
    put_cstring(buf, &fields.code);
    buf.put_u8(b'M');
    put_cstring(buf, &fields.message);
    if let Some(detail) = &fields.detail {
        buf.put_u8(b'D');
        put_cstring(buf, detail);
    }
    buf.put_u8(0);
}

pub async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &BackendMessage,
) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_message(msg, &mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_messages<S: AsyncWrite + Unpin>(
    stream: &mut S,
    messages: &[BackendMessage],
) -> Result<()> {
    let mut buf = BytesMut::new();
    for msg in messages {
        encode_message(msg, &mut buf);
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one message sent by a Postgres server.
pub async fn read_backend_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BackendMessage> {
    let code = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(anyhow!("invalid message length {len} for '{}'", code as char));
    }
    let mut buf = vec![0u8; len as usize - 4];
    stream.read_exact(&mut buf).await?;
    decode_backend(code, &buf)
}

pub fn decode_backend(code: u8, buf: &[u8]) -> Result<BackendMessage> {
    let mut payload = Payload::new(buf);
    let msg = match code {
        b'R' => match payload.i32()? {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let bytes = payload.take(4)?;
                BackendMessage::AuthenticationMd5Password {
                    salt: [bytes[0], bytes[1], bytes[2], bytes[3]],
                }
            }
            other => BackendMessage::AuthenticationOther { code: other },
        },
        b'S' => BackendMessage::ParameterStatus {
            key: payload.cstring()?,
            value: payload.cstring()?,
        },
        b'K' => BackendMessage::BackendKeyData {
            pid: payload.i32()?,
            secret: payload.i32()?,
        },
        b'Z' => {
            let byte = payload.u8()?;
            let state = TransactionState::from_wire(byte)
                .ok_or_else(|| anyhow!("invalid transaction state '{}'", byte as char))?;
            BackendMessage::ReadyForQuery { state }
        }
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b's' => BackendMessage::PortalSuspended,
        b'I' => BackendMessage::EmptyQueryResponse,
        b'c' => BackendMessage::CopyDone,
        b't' => {
            let count = payload.i16()?.max(0) as usize;
            let mut oids = Vec::with_capacity(count);
            for _ in 0..count {
                oids.push(payload.i32()?);
            }
            BackendMessage::ParameterDescription { oids }
        }
        b'T' => {
            let count = payload.i16()?.max(0) as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(Column {
                    name: payload.cstring()?,
                    table_oid: payload.i32()?,
                    column_id: payload.i16()?,
                    type_oid: payload.i32()?,
                    type_size: payload.i16()?,
                    type_modifier: payload.i32()?,
                    format: payload.i16()?,
                });
            }
            BackendMessage::RowDescription { fields }
        }
        b'D' => {
            let count = payload.i16()?.max(0) as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(payload.value()?);
            }
            BackendMessage::DataRow { values }
        }
        b'C' => BackendMessage::CommandComplete {
            tag: payload.cstring()?,
        },
        b'E' => BackendMessage::ErrorResponse {
            fields: read_error_fields(&mut payload)?,
        },
        b'N' => BackendMessage::NoticeResponse {
            fields: read_error_fields(&mut payload)?,
        },
        b'G' | b'H' => {
            let format = payload.u8()? as i8;
            let count = payload.i16()?.max(0) as usize;
            let mut columns = Vec::with_capacity(count);
            for _ in 0..count {
                columns.push(payload.i16()?);
            }
            if code == b'G' {
                BackendMessage::CopyInResponse { format, columns }
            } else {
                BackendMessage::CopyOutResponse { format, columns }
            }
        }
        b'd' => BackendMessage::CopyData {
            data: payload.rest().to_vec(),
        },
        b'A' => BackendMessage::NotificationResponse {
            pid: payload.i32()?,
            channel: payload.cstring()?,
            payload: payload.cstring()?,
        },
        other => return Err(anyhow!("unexpected backend message '{}'", other as char)),
    };
    Ok(msg)
}

fn read_error_fields(payload: &mut Payload<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::new("ERROR", "XX000", "");
    loop {
        let tag = payload.u8()?;
        if tag == 0 {
            break;
        }
        let value = payload.cstring()?;
        match tag {
            b'V' => fields.severity = value,
            b'S' if fields.severity == "ERROR" => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}
