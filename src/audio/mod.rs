/// WAV encoding for the recognition worker
pub mod wav;

pub use wav::{encode_pcm16, load_for_worker};
