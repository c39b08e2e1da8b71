use anyhow::{bail, Result};

use crate::cli::TopicArgs;
use crate::message::topic;

/// Parse a topic expression and print the routing view of it.
pub fn run_topic(args: TopicArgs) -> Result<()> {
    let mut parsed = topic::parse_key(args.expr.as_bytes());
    if parsed.topic.is_empty() {
        bail!("invalid topic expression: {}", args.expr);
    }
    parsed.parse(args.contract, args.wildcard);
    if !parsed.is_valid() {
        bail!("invalid topic expression: {}", args.expr);
    }

    println!("key:    {}", String::from_utf8_lossy(&parsed.key));
    println!("topic:  {}", String::from_utf8_lossy(&parsed.topic));
    println!("kind:   {:?}", parsed.kind);
    println!("depth:  {}", parsed.depth);
    for (i, part) in parsed.parts.iter().enumerate() {
        println!("part {i}: query={:#010x} wildchars={}", part.query, part.wildchars);
    }
    for (key, value) in &parsed.options {
        println!("option: {key}={value}");
    }
    if let Some(ttl) = parsed.ttl() {
        println!("ttl:    {ttl:?}");
    }
    Ok(())
}
