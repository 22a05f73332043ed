use crate::messages::{
    CloseTarget, DescribeTarget, FrontendMessage, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE,
    PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::wire::{frame, put_cstring, put_value, Payload, MAX_MESSAGE_LEN};
use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> Result<FrontendMessage> {
    let len = stream.read_i32().await? as usize;
    if !(8..=10_000).contains(&len) {
        return Err(anyhow!("invalid startup packet length: {len}"));
    }
    let code = stream.read_i32().await?;
    let mut buf = vec![0u8; len - 8];
    stream.read_exact(&mut buf).await?;
    match code {
        PROTOCOL_VERSION => Ok(FrontendMessage::Startup {
            params: parse_params(&buf),
        }),
        SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => Ok(FrontendMessage::SslRequest),
        CANCEL_REQUEST_CODE => {
            let mut payload = Payload::new(&buf);
            Ok(FrontendMessage::CancelRequest {
                pid: payload.i32()?,
                secret: payload.i32()?,
            })
        }
        other => Err(anyhow!("unsupported protocol version: {other}")),
    }
}

pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<FrontendMessage> {
    let msg_type = match stream.read_u8().await {
        Ok(v) => v,
        Err(_) => return Ok(FrontendMessage::Terminate),
    };
    let len = stream.read_i32().await?;
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(anyhow!("invalid message length {len} for '{}'", msg_type as char));
    }
    let mut buf = vec![0u8; len as usize - 4];
    stream.read_exact(&mut buf).await?;
    decode_frontend(msg_type, &buf)
}

pub fn decode_frontend(msg_type: u8, buf: &[u8]) -> Result<FrontendMessage> {
    let mut payload = Payload::new(buf);
    let msg = match msg_type {
        b'Q' => FrontendMessage::Query {
            sql: payload.cstring()?,
        },
        b'p' => FrontendMessage::Password {
            password: payload.cstring()?,
        },
        b'X' => FrontendMessage::Terminate,
        b'P' => {
            let statement_name = payload.cstring()?;
            let query = payload.cstring()?;
            let count = payload.i16()?.max(0) as usize;
            let mut param_oids = Vec::with_capacity(count);
            for _ in 0..count {
                param_oids.push(payload.i32()?);
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                param_oids,
            }
        }
        b'B' => {
            let portal_name = payload.cstring()?;
            let statement_name = payload.cstring()?;
            let count = payload.i16()?.max(0) as usize;
            let mut param_format_codes = Vec::with_capacity(count);
            for _ in 0..count {
                param_format_codes.push(payload.i16()?);
            }
            let count = payload.i16()?.max(0) as usize;
            let mut param_values = Vec::with_capacity(count);
            for _ in 0..count {
                param_values.push(payload.value()?);
            }
            let count = payload.i16()?.max(0) as usize;
            let mut result_format_codes = Vec::with_capacity(count);
            for _ in 0..count {
                result_format_codes.push(payload.i16()?);
            }
            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_format_codes,
                param_values,
                result_format_codes,
            }
        }
        b'D' => {
            let target = match payload.u8()? {
                b'S' => DescribeTarget::Statement,
                b'P' => DescribeTarget::Portal,
                other => return Err(anyhow!("invalid describe target '{}'", other as char)),
            };
            FrontendMessage::Describe {
                target,
                name: payload.cstring()?,
            }
        }
        b'E' => FrontendMessage::Execute {
            portal_name: payload.cstring()?,
            max_rows: payload.i32()?,
        },
        b'S' => FrontendMessage::Sync,
        b'H' => FrontendMessage::Flush,
        b'C' => {
            let target = match payload.u8()? {
                b'S' => CloseTarget::Statement,
                b'P' => CloseTarget::Portal,
                other => return Err(anyhow!("invalid close target '{}'", other as char)),
            };
            FrontendMessage::Close {
                target,
                name: payload.cstring()?,
            }
        }
        b'd' => FrontendMessage::CopyData {
            data: payload.rest().to_vec(),
        },
        b'c' => FrontendMessage::CopyDone,
        b'f' => FrontendMessage::CopyFail {
            message: payload.cstring()?,
        },
        other => FrontendMessage::Unsupported { code: other },
    };
    Ok(msg)
}

/// Encode a message the way a client sends it; used on backend connections.
pub fn encode_frontend(msg: &FrontendMessage, buf: &mut BytesMut) -> Result<()> {
    let mut payload = BytesMut::new();
    match msg {
        FrontendMessage::Startup { params } => {
            payload.put_i32(PROTOCOL_VERSION);
            let mut keys: Vec<&String> = params.keys().collect();
            keys.sort();
            for key in keys {
                put_cstring(&mut payload, key);
                put_cstring(&mut payload, &params[key]);
            }
            payload.put_u8(0);
            buf.put_i32((payload.len() + 4) as i32);
            buf.extend_from_slice(&payload);
            return Ok(());
        }
        FrontendMessage::SslRequest => {
            buf.put_i32(8);
            buf.put_i32(SSL_REQUEST_CODE);
            return Ok(());
        }
        FrontendMessage::CancelRequest { pid, secret } => {
            buf.put_i32(16);
            buf.put_i32(CANCEL_REQUEST_CODE);
            buf.put_i32(*pid);
            buf.put_i32(*secret);
            return Ok(());
        }
        FrontendMessage::Query { sql } => {
            put_cstring(&mut payload, sql);
            frame(buf, b'Q', &payload);
        }
        FrontendMessage::Password { password } => {
            put_cstring(&mut payload, password);
            frame(buf, b'p', &payload);
        }
        FrontendMessage::Terminate => frame(buf, b'X', &[]),
        FrontendMessage::Parse {
            statement_name,
            query,
            param_oids,
        } => {
            put_cstring(&mut payload, statement_name);
            put_cstring(&mut payload, query);
            payload.put_i16(param_oids.len() as i16);
            for oid in param_oids {
                payload.put_i32(*oid);
            }
            frame(buf, b'P', &payload);
        }
        FrontendMessage::Bind {
            portal_name,
            statement_name,
            param_format_codes,
            param_values,
            result_format_codes,
        } => {
            put_cstring(&mut payload, portal_name);
            put_cstring(&mut payload, statement_name);
            payload.put_i16(param_format_codes.len() as i16);
            for code in param_format_codes {
                payload.put_i16(*code);
            }
            payload.put_i16(param_values.len() as i16);
            for value in param_values {
                put_value(&mut payload, value);
            }
            payload.put_i16(result_format_codes.len() as i16);
            for code in result_format_codes {
                payload.put_i16(*code);
            }
            frame(buf, b'B', &payload);
        }
        FrontendMessage::Describe { target, name } => {
            payload.put_u8(match target {
                DescribeTarget::Statement => b'S',
                DescribeTarget::Portal => b'P',
            });
            put_cstring(&mut payload, name);
            frame(buf, b'D', &payload);
        }
        FrontendMessage::Execute {
            portal_name,
            max_rows,
        } => {
            put_cstring(&mut payload, portal_name);
            payload.put_i32(*max_rows);
            frame(buf, b'E', &payload);
        }
        FrontendMessage::Sync => frame(buf, b'S', &[]),
        FrontendMessage::Flush => frame(buf, b'H', &[]),
        FrontendMessage::Close { target, name } => {
            payload.put_u8(match target {
                CloseTarget::Statement => b'S',
                CloseTarget::Portal => b'P',
            });
            put_cstring(&mut payload, name);
            frame(buf, b'C', &payload);
        }
        FrontendMessage::CopyData { data } => frame(buf, b'd', data),
        FrontendMessage::CopyDone => frame(buf, b'c', &[]),
        FrontendMessage::CopyFail { message } => {
            put_cstring(&mut payload, message);
            frame(buf, b'f', &payload);
        }
        FrontendMessage::Unsupported { code } => {
            return Err(anyhow!("cannot encode unsupported message '{}'", *code as char))
        }
    }
    Ok(())
}

/// Encode and send a batch of messages with a single flush.
pub async fn write_frontend<S: AsyncWrite + Unpin>(
    stream: &mut S,
    messages: &[FrontendMessage],
) -> Result<()> {
    let mut buf = BytesMut::new();
    for msg in messages {
        encode_frontend(msg, &mut buf)?;
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn parse_params(buf: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut payload = Payload::new(buf);
    while payload.remaining() > 0 {
        let key = match payload.cstring() {
            Ok(key) if !key.is_empty() => key,
            _ => break,
        };
        let value = match payload.cstring() {
            Ok(value) => value,
            Err(_) => break,
        };
        params.insert(key, value);
    }
    params
}
