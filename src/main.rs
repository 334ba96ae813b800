fn main() -> anyhow::Result<()> {
  transcript_player::run()
}
