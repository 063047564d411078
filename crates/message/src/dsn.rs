//! Builds RFC 3464 delivery-status-notification messages summarizing the
//! permanently- and temporarily-failed recipients of a message that has
//! exhausted its retry budget or completed with partial failures.

use crate::message::{Message, MetaData, RecipientFailure};
use crate::EnvelopeAddress;
use mail_builder::headers::content_type::ContentType;
use mail_builder::headers::HeaderType;
use mail_builder::mime::{BodyPart, MimePart};
use mail_builder::MessageBuilder;
use std::fmt::Write as _;

/// Everything the composer needs besides the failing message itself.
pub struct DsnParams<'a> {
    /// Hostname reported in `Reporting-MTA` and used to synthesize the
    /// envelope sender `MAILER-DAEMON@<reporting_mta>`.
    pub reporting_mta: &'a str,
}

/// Builds the three-part multipart/report body for `message`'s failures.
/// Returns `None` if there is nothing to report (no permanent failures and
/// no temporary ones worth notifying about).
pub fn compose(message: &Message, params: &DsnParams) -> anyhow::Result<Option<(Vec<u8>, Vec<u8>)>> {
    anyhow::ensure!(
        !message.is_dsn(),
        "refusing to generate a DSN for a message that is itself a DSN"
    );

    let meta = message.clone_metadata();
    if meta.permanently_failed.is_empty() && meta.temporarily_failed.is_empty() {
        return Ok(None);
    }

    let summary = build_summary_text(&meta);
    let delivery_status = build_delivery_status(&meta, params.reporting_mta);
    let original_headers = String::from_utf8_lossy(&message.header()?).into_owned();

    let built = MessageBuilder::new()
        .from(("Mail Delivery Subsystem", mailer_daemon(params.reporting_mta).as_str()))
        .header("To", HeaderType::Text(meta.sender.as_str().into()))
        .header("Auto-Submitted", HeaderType::Text("auto-generated".into()))
        .subject(dsn_subject(&meta))
        .body(MimePart::new(
            ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
            BodyPart::Multipart(vec![
                MimePart::new(ContentType::new("text/plain"), BodyPart::Text(summary.into())),
                MimePart::new(
                    ContentType::new("message/delivery-status"),
                    BodyPart::Text(delivery_status.into()),
                ),
                MimePart::new(
                    ContentType::new("message/rfc822"),
                    BodyPart::Text(original_headers.into()),
                ),
            ]),
        ))
        .write_to_vec()?;

    Ok(Some(split_header_and_body(built)))
}

pub fn mailer_daemon(reporting_mta: &str) -> String {
    format!("MAILER-DAEMON@{reporting_mta}")
}

/// Envelope sender to use for the DSN itself: the null sender, per RFC
/// 3464 §2.1, so that a bounce of a bounce can never be generated.
pub fn dsn_envelope_sender() -> EnvelopeAddress {
    EnvelopeAddress::null_sender()
}

fn dsn_subject(meta: &MetaData) -> &'static str {
    let has_perm = !meta.permanently_failed.is_empty();
    let has_temp = !meta.temporarily_failed.is_empty();
    match (has_perm, has_temp) {
        (true, true) => "Warning: Temporary and permanent failures during message delivery",
        (true, false) => "Failed to deliver message",
        (false, true) => "Warning: Delay in message delivery",
        (false, false) => "Delivery status notification",
    }
}

fn build_summary_text(meta: &MetaData) -> String {
    let mut txt = String::new();
    if !meta.permanently_failed.is_empty() {
        txt.push_str("Your message could not be delivered to the following recipients:\r\n\r\n");
        for f in &meta.permanently_failed {
            let _ = writeln!(txt, "    {} -- {}\r", f.recipient, f.error.message);
        }
        txt.push_str("\r\n");
    }
    if !meta.temporarily_failed.is_empty() {
        txt.push_str("There was a temporary problem delivering your message to:\r\n\r\n");
        for f in &meta.temporarily_failed {
            let _ = writeln!(txt, "    {} -- {}\r", f.recipient, f.error.message);
        }
        txt.push_str("\r\n");
    }
    txt
}

fn build_delivery_status(meta: &MetaData, reporting_mta: &str) -> String {
    let mut dsn = String::new();
    let _ = writeln!(dsn, "Reporting-MTA: dns;{reporting_mta}\r");
    let _ = writeln!(dsn, "Arrival-Date: {}\r", meta.created.to_rfc2822());
    dsn.push_str("\r\n");

    let last_attempt = meta.last_attempt.unwrap_or(meta.created);
    for f in &meta.permanently_failed {
        write_recipient_block(&mut dsn, f, "failed", last_attempt);
    }
    for f in &meta.temporarily_failed {
        write_recipient_block(&mut dsn, f, "delayed", last_attempt);
    }
    dsn
}

fn write_recipient_block(
    dsn: &mut String,
    f: &RecipientFailure,
    action: &str,
    last_attempt: chrono::DateTime<chrono::Utc>,
) {
    let _ = writeln!(dsn, "Final-Recipient: rfc822;{}\r", f.recipient);
    let _ = writeln!(dsn, "Action: {action}\r");
    let status = f
        .error
        .enhanced_code
        .map(|e| format!("{}.{}.{}", e.class, e.subject, e.detail))
        .unwrap_or_else(|| {
            let leading = f.error.code / 100;
            format!("{leading}.0.0")
        });
    let _ = writeln!(dsn, "Status: {status}\r");
    let _ = writeln!(
        dsn,
        "Diagnostic-Code: smtp;{} {}\r",
        f.error.code,
        f.error.message.replace(['\r', '\n'], " ")
    );
    let _ = writeln!(dsn, "Last-Attempt-Date: {}\r", last_attempt.to_rfc2822());
    dsn.push_str("\r\n");
}

fn split_header_and_body(full: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    if let Some(pos) = full.windows(4).position(|w| w == b"\r\n\r\n") {
        let (header, rest) = full.split_at(pos + 4);
        (header.to_vec(), rest.to_vec())
    } else {
        (Vec::new(), full)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{RecordedError, SourceInfo};

    fn addr(s: &str) -> EnvelopeAddress {
        EnvelopeAddress::parse(s).unwrap()
    }

    #[test]
    fn no_failures_means_no_dsn() {
        let msg = Message::new(
            addr("sender@example.com"),
            vec![addr("a@dest.com")],
            b"Subject: hi\r\n\r\n".to_vec(),
            b"hi\r\n".to_vec(),
            SourceInfo::default(),
        );
        let result = compose(&msg, &DsnParams { reporting_mta: "mx.example.com" }).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn permanent_failure_produces_three_part_report() {
        let msg = Message::new(
            addr("sender@example.com"),
            vec![addr("a@dest.com")],
            b"Subject: hi\r\nFrom: sender@example.com\r\n\r\n".to_vec(),
            b"hi\r\n".to_vec(),
            SourceInfo::default(),
        );
        msg.mark_permanently_failed(
            addr("a@dest.com"),
            RecordedError {
                code: 550,
                enhanced_code: None,
                message: "no such user".into(),
                command: Some("RCPT TO".into()),
            },
        );

        let (header, body) = compose(&msg, &DsnParams { reporting_mta: "mx.example.com" })
            .unwrap()
            .expect("dsn expected");
        let full = String::from_utf8(header).unwrap() + &String::from_utf8(body).unwrap();
        assert!(full.contains("multipart/report"));
        assert!(full.contains("message/delivery-status"));
        assert!(full.contains("message/rfc822"));
        assert!(full.contains("Final-Recipient: rfc822;a@dest.com"));
        assert!(full.contains("Arrival-Date: "));
        assert!(full.contains("Last-Attempt-Date: "));
    }

    #[test]
    fn refuses_to_bounce_a_dsn() {
        let msg = Message::new(
            addr("sender@example.com"),
            vec![addr("a@dest.com")],
            b"Subject: hi\r\n\r\n".to_vec(),
            b"hi\r\n".to_vec(),
            SourceInfo::default(),
        );
        msg.set_is_dsn();
        msg.mark_permanently_failed(
            addr("a@dest.com"),
            RecordedError::internal("boom"),
        );
        assert!(compose(&msg, &DsnParams { reporting_mta: "mx.example.com" }).is_err());
    }
}
