//! End-to-end scenarios against a real checkpoint.
//!
//! These tests need model weights and a known clip, so they are gated on
//! environment variables and skip silently otherwise:
//!
//!   VOXTRAL_MODEL_DIR  directory with tekken.json + params/config + weights
//!   VOXTRAL_E2E_WAV    16 kHz clip containing the Wisconsin/Sikh-temple
//!                      phrase used by the reference scenario

use std::path::PathBuf;

use voxtral_realtime_mlx::{
    audio, RealtimeOptions, RealtimeSession, TranscribeOptions, Transcriber, VoxtralModel,
};

fn e2e_inputs() -> Option<(PathBuf, PathBuf)> {
    let model = std::env::var("VOXTRAL_MODEL_DIR").ok()?;
    let wav = std::env::var("VOXTRAL_E2E_WAV").ok()?;
    Some((PathBuf::from(model), PathBuf::from(wav)))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[test]
fn offline_transcribes_known_clip() {
    let Some((model_dir, wav)) = e2e_inputs() else {
        eprintln!("skipping: VOXTRAL_MODEL_DIR / VOXTRAL_E2E_WAV not set");
        return;
    };

    let (model, tokenizer) = VoxtralModel::load(&model_dir).expect("load model");
    let mut transcriber = Transcriber::new(model, tokenizer).expect("transcriber");

    let options = TranscribeOptions {
        temperature: 0.0,
        max_new_tokens: 200,
    };
    let result = transcriber.transcribe_file(&wav, &options).expect("transcribe");

    let lower = result.text.to_lowercase();
    assert!(
        lower.contains("three years ago in our state of wisconsin"),
        "transcript missing opening phrase: {lower}"
    );
    assert!(
        lower.contains("sikh temple"),
        "transcript missing key phrase: {lower}"
    );
}

#[test]
fn streaming_chunks_match_offline_transcript() {
    let Some((model_dir, wav)) = e2e_inputs() else {
        eprintln!("skipping: VOXTRAL_MODEL_DIR / VOXTRAL_E2E_WAV not set");
        return;
    };

    let samples = audio::load_audio(&wav).expect("load wav");

    let (model, tokenizer) = VoxtralModel::load(&model_dir).expect("load model");
    let mut transcriber = Transcriber::new(model, tokenizer).expect("transcriber");
    let offline = transcriber
        .transcribe(
            &samples,
            &TranscribeOptions {
                temperature: 0.0,
                max_new_tokens: 400,
            },
        )
        .expect("offline transcription");
    let (model, tokenizer) = transcriber.into_parts();

    let mut session =
        RealtimeSession::new(model, tokenizer, &RealtimeOptions::default()).expect("session");
    let mut streamed = String::new();
    for chunk in samples.chunks(audio::SAMPLES_PER_TOKEN) {
        streamed.push_str(&session.append_audio_samples(chunk).expect("append"));
    }
    streamed.push_str(&session.finish_stream().expect("finish"));

    assert_eq!(
        normalize_whitespace(&streamed),
        normalize_whitespace(&offline.text),
        "streaming and offline transcripts diverge"
    );
}
