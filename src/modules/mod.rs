pub mod animation_encoder;
pub mod face_detection_client;
pub mod video_recorder;
