#[cfg(test)]
mod tests {
    use crate::backend::{read_backend_message, write_message, write_messages};
    use crate::frontend::{read_message, read_startup, write_frontend};
    use crate::messages::{
        BackendMessage, DescribeTarget, ErrorFields, FrontendMessage, TransactionState,
    };
    use pgshard_core::{Column, ProxyError};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn startup_parses_params() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let params = b"user\0alice\0database\0shop\0\0";
        let len = (params.len() + 8) as i32;
        let protocol = 196608i32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&protocol.to_be_bytes());
        buf.extend_from_slice(params);
        client.write_all(&buf).await.expect("write");
        let msg = read_startup(&mut server).await.expect("read");
        match msg {
            FrontendMessage::Startup { params } => {
                assert_eq!(params.get("user").cloned(), Some("alice".into()));
                assert_eq!(params.get("database").cloned(), Some("shop".into()));
            }
            _ => panic!("unexpected startup"),
        }
    }

    #[tokio::test]
    async fn ssl_request_is_recognized() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frontend(&mut client, &[FrontendMessage::SslRequest])
            .await
            .expect("write");
        let msg = read_startup(&mut server).await.expect("read");
        assert_eq!(msg, FrontendMessage::SslRequest);
    }

    #[tokio::test]
    async fn startup_rejects_bad_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&4i32.to_be_bytes()).await.expect("write");
        assert!(read_startup(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn write_auth_cleartext_message() {
        let (mut client, mut server) = tokio::io::duplex(32);
        write_message(&mut server, &BackendMessage::AuthenticationCleartextPassword)
            .await
            .expect("write");
        let mut bytes = [0u8; 9];
        client.read_exact(&mut bytes).await.expect("read");
        assert_eq!(bytes[0], b'R');
        assert_eq!(i32::from_be_bytes(bytes[1..5].try_into().unwrap()), 8);
        assert_eq!(i32::from_be_bytes(bytes[5..9].try_into().unwrap()), 3);
    }

    #[tokio::test]
    async fn ready_for_query_carries_state() {
        let (mut client, mut server) = tokio::io::duplex(32);
        write_message(&mut server, &BackendMessage::ready(TransactionState::Error))
            .await
            .expect("write");
        let mut bytes = [0u8; 6];
        client.read_exact(&mut bytes).await.expect("read");
        assert_eq!(bytes[0], b'Z');
        assert_eq!(i32::from_be_bytes(bytes[1..5].try_into().unwrap()), 5);
        assert_eq!(bytes[5], b'E');
    }

    #[tokio::test]
    async fn extended_batch_is_decoded_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let batch = vec![
            FrontendMessage::Parse {
                statement_name: "s1".into(),
                query: "SELECT * FROM users WHERE id = $1".into(),
                param_oids: vec![20],
            },
            FrontendMessage::Bind {
                portal_name: String::new(),
                statement_name: "s1".into(),
                param_format_codes: vec![0],
                param_values: vec![Some(b"42".to_vec()), None],
                result_format_codes: vec![],
            },
            FrontendMessage::Describe {
                target: DescribeTarget::Portal,
                name: String::new(),
            },
            FrontendMessage::Execute {
                portal_name: String::new(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ];
        write_frontend(&mut client, &batch).await.expect("write");
        for expected in batch {
            let msg = read_message(&mut server).await.expect("read");
            assert_eq!(msg, expected);
        }
    }

    #[tokio::test]
    async fn eof_reads_as_terminate() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        let msg = read_message(&mut server).await.expect("read");
        assert_eq!(msg, FrontendMessage::Terminate);
    }

    #[tokio::test]
    async fn result_set_survives_the_wire() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let messages = vec![
            BackendMessage::RowDescription {
                fields: vec![Column::bigint("id"), Column::text("email")],
            },
            BackendMessage::DataRow {
                values: vec![Some(b"1".to_vec()), None],
            },
            BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            },
            BackendMessage::ready(TransactionState::Transaction),
        ];
        write_messages(&mut server, &messages).await.expect("write");
        for expected in messages {
            let msg = read_backend_message(&mut client).await.expect("read");
            assert_eq!(msg, expected);
        }
    }

    #[tokio::test]
    async fn proxy_errors_map_to_sqlstate() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let err = ProxyError::ReadOnlyTransactionViolation {
            command: "INSERT".into(),
        };
        write_message(&mut server, &BackendMessage::error(&err))
            .await
            .expect("write");
        match read_backend_message(&mut client).await.expect("read") {
            BackendMessage::ErrorResponse { fields } => {
                assert_eq!(fields.code, "25006");
                assert_eq!(fields.severity, "ERROR");
                assert_eq!(
                    fields.message,
                    "cannot execute INSERT in a read-only transaction"
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn startup_encoding_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut params = HashMap::new();
        params.insert("user".to_string(), "app".to_string());
        params.insert("database".to_string(), "shard_0".to_string());
        let startup = FrontendMessage::Startup { params };
        write_frontend(&mut client, &[startup.clone()])
            .await
            .expect("write");
        assert_eq!(read_startup(&mut server).await.expect("read"), startup);
    }

    #[test]
    fn notice_keeps_detail() {
        let mut fields = ErrorFields::new("WARNING", "01000", "careful");
        fields.detail = Some("more".into());
        let mut buf = bytes::BytesMut::new();
        crate::backend::encode_message(
            &BackendMessage::NoticeResponse {
                fields: fields.clone(),
            },
            &mut buf,
        );
        let decoded = crate::backend::decode_backend(buf[0], &buf[5..]).expect("decode");
        assert_eq!(decoded, BackendMessage::NoticeResponse { fields });
    }
}
