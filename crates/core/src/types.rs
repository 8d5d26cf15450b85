/// Identity of whoever requested a generation (e.g. a chat user id).
pub type ActorId = i64;
