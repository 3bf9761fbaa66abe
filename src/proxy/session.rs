use sha2::{Digest, Sha256};

use crate::proxy::chat::Message;

// Stable per-conversation fingerprint used to address the summary cache.
//
// Only the first meaningful user message is hashed: every turn of the same
// conversation then resolves to the same key, which is what keeps the cache
// hit rate useful. Model names and timestamps are deliberately excluded.
pub struct SessionManager;

impl SessionManager {
    pub fn extract_session_id(messages: &[Message]) -> String {
        let mut hasher = Sha256::new();
        let mut content_found = false;

        for msg in messages {
            if msg.role != "user" {
                continue;
            }
            let text = msg.text();
            let clean = text.trim();
            // very short messages are usually CLI probes; system-reminder
            // payloads vary per turn and would break key stability
            if clean.len() > 10 && !clean.contains("<system-reminder>") {
                hasher.update(clean.as_bytes());
                content_found = true;
                break;
            }
        }

        if !content_found {
            if let Some(last) = messages.last() {
                hasher.update(last.text().as_bytes());
            }
        }

        let hash = format!("{:x}", hasher.finalize());
        let sid = format!("sid-{}", &hash[..16]);
        tracing::debug!(
            "[SessionManager] Generated session_id: {} (content_found: {})",
            sid,
            content_found
        );
        sid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_opening_message_gives_same_key() {
        let a = vec![Message::user("please refactor the parser module")];
        let mut b = a.clone();
        b.push(Message::assistant("sure"));
        b.push(Message::user("now add tests"));
        assert_eq!(
            SessionManager::extract_session_id(&a),
            SessionManager::extract_session_id(&b)
        );
    }

    #[test]
    fn short_probe_messages_are_skipped() {
        let probe_then_real = vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::user("please refactor the parser module"),
        ];
        let real_only = vec![Message::user("please refactor the parser module")];
        assert_eq!(
            SessionManager::extract_session_id(&probe_then_real),
            SessionManager::extract_session_id(&real_only)
        );
    }

    #[test]
    fn different_conversations_differ() {
        let a = vec![Message::user("please refactor the parser module")];
        let b = vec![Message::user("please delete the parser module")];
        assert_ne!(
            SessionManager::extract_session_id(&a),
            SessionManager::extract_session_id(&b)
        );
    }
}
