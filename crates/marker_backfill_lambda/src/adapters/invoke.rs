/// Fire-and-forget dispatch of the next invocation with a resume payload.
pub trait ContinuationInvoker {
    fn invoke_async(&self, payload: &[u8]) -> Result<(), String>;
}
