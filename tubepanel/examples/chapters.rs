//! Print a video's chapters as a table.
//!
//! Usage: cargo run --example chapters -- https://youtu.be/<id>

#[tokio::main]
async fn main() -> tubepanel::Result<()> {
    let url = std::env::args()
        .nth(1)
        .expect("usage: chapters <video-url>");

    let config = tubepanel::AppConfig::load()?;
    let video = tubepanel::fetch_video_chapters(&config, &url).await?;

    println!("{} ({})", video.video_title, video.source_url);
    if video.chapters.is_empty() {
        println!("no chapters");
    }
    for chapter in &video.chapters {
        println!(
            "{:>3}  {} - {}  {}",
            chapter.index, chapter.start, chapter.end, chapter.title
        );
    }

    Ok(())
}
