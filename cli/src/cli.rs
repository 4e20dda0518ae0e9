use clap::{Parser, Subcommand};
use libmoodle::download::destination_dir;
use libmoodle::{
    Course, DownloadRule, FileEntry, FolderSection, HttpSession, Message, Moodle, MoodleError,
    Update,
};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{channel, Sender};
use url::Url;

const PROGRESS_UPDATE_INTERVAL: u64 = 1000;
const MAX_BUFFER_SIZE: usize = 100;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A course file downloader for Moodle",
    long_about = "Lists the courses, folders and files of a Moodle account and downloads \
    the files into a local directory tree."
)]
pub struct Cli {
    #[arg(long, env = "MOODLE_URL", help = "Portal address, e.g. https://moodle.example.edu")]
    url: Url,
    #[arg(short, long, env = "MOODLE_USERNAME")]
    username: String,
    #[arg(short, long, env = "MOODLE_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long, global = true, help = "Print listings as JSON.")]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the courses the account is enrolled in
    Courses,
    /// List the folder sections of a course
    Folders { course: String },
    /// List every file of every folder in a course
    Files { course: String },
    /// Download course files into OUTPUT_DIRECTORY/<course>/<section>/<folder>/...
    Sync {
        output_directory: PathBuf,
        #[arg(help = "Course titles to download. Downloads every course when left out.")]
        courses: Vec<String>,
        #[arg(default_value = "500000000", help = "Max file size in bytes.", long)]
        max_file_size: u64,
        #[arg(
            help = "Download files even if their size can't be determined. Defaults to true.",
            long
        )]
        download_files_with_unknown_size: Option<bool>,
        #[arg(
            long = "blacklist",
            help = "Links containing this text won't be downloaded. Can be repeated."
        )]
        blacklist_urls: Vec<String>,
    },
    /// Print the ETag the portal reports for a file
    Etag { file_url: String },
}

#[derive(Debug, Default, PartialEq)]
struct SyncSummary {
    downloaded: usize,
    skipped: usize,
    failed: usize,
}

impl Cli {
    pub async fn run(self) -> Result<(), MoodleError> {
        let mut moodle = Moodle::connect(self.url.as_str())?;
        moodle.login(&self.username, &self.password).await?;
        println!("{}", format!("Logged in as {}", self.username).green());

        match self.command {
            Command::Courses => {
                let courses = moodle.get_courses().await?;
                if self.json {
                    print_json(&courses);
                } else {
                    for course in courses.iter() {
                        println!("{} | {}", course.title.bold(), course.url);
                    }
                }
            }
            Command::Folders { course } => {
                moodle.get_courses().await?;
                let sections = moodle.get_folders_in_course(&course).await?;
                if self.json {
                    print_json(&sections);
                } else {
                    print_sections(&sections);
                }
            }
            Command::Files { course } => {
                moodle.get_courses().await?;
                let sections = moodle.get_folders_in_course(&course).await?;
                let files = list_files(&moodle, &sections).await;
                if self.json {
                    print_json(&files);
                } else {
                    for (folder, entries) in files {
                        println!("{}", folder.bold());
                        for entry in entries {
                            println!("  {} | {}", entry_path(&entry), entry.url);
                        }
                    }
                }
            }
            Command::Sync {
                output_directory,
                courses,
                max_file_size,
                download_files_with_unknown_size,
                blacklist_urls,
            } => {
                let rule = DownloadRule {
                    max_file_size,
                    download_files_with_unknown_size: download_files_with_unknown_size
                        .unwrap_or(true),
                    progress_update_interval: PROGRESS_UPDATE_INTERVAL,
                    black_list_urls: blacklist_urls,
                };
                sync(moodle, courses, output_directory, rule).await?;
            }
            Command::Etag { file_url } => match moodle.file_etag(&file_url).await? {
                Some(etag) => println!("{etag}"),
                None => println!("{}", "No ETag reported".yellow()),
            },
        }
        Ok(())
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("{}", format!("Error serializing output: {e}").red()),
    }
}

fn print_sections(sections: &[FolderSection]) {
    for section in sections {
        println!("{}", section.title.bold());
        if section.folders.is_empty() {
            println!("  {}", "(no folders)".dimmed());
        }
        for folder in section.folders.iter() {
            println!("  {} | {}", folder.title, folder.url);
        }
    }
}

fn entry_path(entry: &FileEntry) -> String {
    let mut parts = entry.path.clone();
    parts.push(entry.name.clone());
    parts.join("/")
}

/// Files of every folder, keyed by folder title. A folder that fails to load is
/// reported and left out; the others are still listed.
async fn list_files(
    moodle: &Moodle<HttpSession>,
    sections: &[FolderSection],
) -> Vec<(String, Vec<FileEntry>)> {
    let mut listing = Vec::new();
    for folder in sections.iter().flat_map(|section| section.folders.iter()) {
        match moodle.get_files_in_folder(&folder.url).await {
            Ok(files) => listing.push((folder.title.clone(), files)),
            Err(e) => {
                tracing::error!("Error listing folder {}\n{}", folder.url, e);
                eprintln!("{}", format!("Couldn't list {} : {e}", folder.title).red());
            }
        }
    }
    listing
}

async fn sync(
    moodle: Moodle<HttpSession>,
    titles: Vec<String>,
    output_directory: PathBuf,
    rule: DownloadRule,
) -> Result<(), MoodleError> {
    println!("Initializing download....");
    let (tx, mut rx) = channel::<Update>(MAX_BUFFER_SIZE);
    let task = tokio::spawn(async move {
        sync_courses(moodle, &titles, &output_directory, &rule, tx).await
    });
    while let Some(update) = rx.recv().await {
        match update {
            Update::MessageUpdate(msg) => {
                if msg.is_error {
                    println!("{} | {}", msg.content.red(), msg.resource_name);
                } else {
                    println!("{} | {}", msg.content, msg.resource_name);
                }
            }
            Update::ProgressUpdate(progress) => {
                if progress.bytes_written >= progress.file_size {
                    println!(
                        "{} {} {} bytes",
                        "[Downloaded]".green(),
                        progress.resource_name,
                        progress.file_size
                    )
                }
            }
        };
    }
    let summary = match task.await {
        Ok(result) => result?,
        Err(e) => {
            tracing::error!("Download thread panicked\nError : {}", e);
            println!("{}", "Download wasn't able to complete".red());
            return Ok(());
        }
    };
    println!(
        "{} downloaded, {} skipped, {} failed",
        summary.downloaded.to_string().green(),
        summary.skipped,
        summary.failed.to_string().red()
    );
    Ok(())
}

fn selected_courses(moodle: &Moodle<HttpSession>, titles: &[String]) -> Result<Vec<Course>, MoodleError> {
    if titles.is_empty() {
        return Ok(moodle.courses().to_vec());
    }
    titles
        .iter()
        .map(|title| moodle.course(title).cloned())
        .collect()
}

async fn report(update_tx: &Sender<Update>, resource_name: &str, content: String) {
    if (update_tx
        .send(Update::MessageUpdate(Message {
            content,
            resource_name: resource_name.to_string(),
            is_error: true,
        }))
        .await)
        .is_err()
    {};
}

/// Downloads one file after another. A course, folder or file that fails is
/// reported and counted; the rest carry on.
async fn sync_courses(
    mut moodle: Moodle<HttpSession>,
    titles: &[String],
    root: &Path,
    rule: &DownloadRule,
    update_tx: Sender<Update>,
) -> Result<SyncSummary, MoodleError> {
    moodle.get_courses().await?;
    let courses = selected_courses(&moodle, titles)?;
    let mut summary = SyncSummary::default();

    for course in courses.iter() {
        let sections = match moodle.get_folders_in_course(&course.title).await {
            Ok(sections) => sections,
            Err(e) => {
                report(&update_tx, &course.title, format!("Couldn't list folders. {e}")).await;
                summary.failed += 1;
                continue;
            }
        };
        for section in sections.iter() {
            for folder in section.folders.iter() {
                let files = match moodle.get_files_in_folder(&folder.url).await {
                    Ok(files) => files,
                    Err(e) => {
                        report(&update_tx, &folder.title, format!("Couldn't list files. {e}"))
                            .await;
                        summary.failed += 1;
                        continue;
                    }
                };
                for entry in files.iter() {
                    let dir = destination_dir(root, course, section, folder, entry);
                    match moodle
                        .download_file(entry, dir, rule, update_tx.clone())
                        .await
                    {
                        Ok(Some(_)) => summary.downloaded += 1,
                        Ok(None) => summary.skipped += 1,
                        Err(MoodleError::ChannelClosed) => return Err(MoodleError::ChannelClosed),
                        Err(e) => {
                            report(&update_tx, &entry.name, e.to_string()).await;
                            summary.failed += 1;
                        }
                    }
                }
            }
        }
    }
    Ok(summary)
}
