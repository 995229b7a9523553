//! Topic routing rules shared by the in-process broker and the topology helpers.
//!
//! Routing keys and binding patterns are dot separated words. In a binding pattern
//! `*` substitutes for exactly one word and `#` for zero or more words.

use crate::RabbitMQError;

/// AMQP short strings cap routing keys at 255 bytes.
pub const MAX_ROUTING_KEY_LEN: usize = 255;

/// Checks whether `routing_key` matches the topic binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&words(pattern), &words(routing_key))
}

fn words(value: &str) -> Vec<&str> {
    if value.is_empty() {
        Vec::new()
    } else {
        value.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // '#' swallows any number of words, including none
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Rejects routing keys the broker would refuse to carry.
pub fn validate_routing_key(routing_key: &str) -> Result<(), RabbitMQError> {
    if routing_key.len() > MAX_ROUTING_KEY_LEN {
        return Err(RabbitMQError::InvalidRoutingKey(routing_key.to_owned()));
    }
    Ok(())
}
